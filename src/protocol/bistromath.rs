use crate::hexdump::hexdump;
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, Once};
use std::thread;

// The full opcode table of the family; the emulation only ever drives a
// handful of them but the table is the wire-contract record.
const OP_BEACON: u8 = 0x3;
const OP_BEACON_RESP: u8 = 0x4;
#[allow(dead_code)]
const OP_DIRECTORY_LIST: u8 = 0x5;
const OP_FILE_UPLOAD: u8 = 0x7;
const OP_FILE_UPLOAD_RESP: u8 = 0x8;
const OP_FILE_DOWNLOAD: u8 = 0x9;
const OP_FILE_DOWNLOAD_DATA: u8 = 0xa;
#[allow(dead_code)]
const OP_FILE_COPY: u8 = 0xb;
#[allow(dead_code)]
const OP_FILE_MOVE: u8 = 0xd;
#[allow(dead_code)]
const OP_FILE_RENAME: u8 = 0xf;
#[allow(dead_code)]
const OP_FILE_DELETE: u8 = 0x11;
#[allow(dead_code)]
const OP_DIRECTORY_CREATE: u8 = 0x13;
#[allow(dead_code)]
const OP_TIMESTOMP: u8 = 0x15;
#[allow(dead_code)]
const OP_PROCESS_LIST: u8 = 0x17;
#[allow(dead_code)]
const OP_PROCESS_KILL: u8 = 0x19;
#[allow(dead_code)]
const OP_SERVICE_LIST: u8 = 0x1b;
#[allow(dead_code)]
const OP_SERVICE_START: u8 = 0x1d;
#[allow(dead_code)]
const OP_SERVICE_STOP: u8 = 0x1f;
const OP_COMMAND_PIPE: u8 = 0x21;
const OP_COMMAND_PIPE_RESP: u8 = 0x22;
#[allow(dead_code)]
const OP_LIBRARY_LOAD: u8 = 0x23;
#[allow(dead_code)]
const OP_LIBRARY_UNLOAD: u8 = 0x25;
#[allow(dead_code)]
const OP_FILE_SIZE: u8 = 0x28;
const OP_FILE_DOWNLOAD_COMPLETE: u8 = 0x2a;
#[allow(dead_code)]
const OP_SCREENSHOT: u8 = 0x2b;
#[allow(dead_code)]
const OP_MICROPHONE_CAPTURE: u8 = 0x2d;
#[allow(dead_code)]
const OP_KEYLOGGER: u8 = 0x2f;
#[allow(dead_code)]
const OP_BROWSER_ACTIVITY1: u8 = 0x31;
#[allow(dead_code)]
const OP_CACHE_PASSWORD: u8 = 0x33;
#[allow(dead_code)]
const OP_DISCONNECT: u8 = 0x35;
#[allow(dead_code)]
const OP_BROWSER_ACTIVITY2: u8 = 0x42;
const OP_ERROR: u8 = 0x46;
#[allow(dead_code)]
const OP_LOG_GET: u8 = 0x50;
const OP_FILE_DOWNLOAD_SIZE: u8 = 0x53;
#[allow(dead_code)]
const OP_WEBCAM_CAPTURE: u8 = 0x54;
#[allow(dead_code)]
const OP_UNINSTALL: u8 = 0x58;
#[allow(dead_code)]
const OP_WINDOWS_LIST: u8 = 0x59;

const AUTH_CODE: u32 = 0x9ebf5072;

/// Bistromath protocol handler. Frames are a 13-byte little-endian
/// header (opcode u8, length u32, unused u32, auth code u32) with a
/// single-byte-XOR ciphered payload. The server speaks first with a
/// beacon request as soon as the agent connects.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    transfer: Mutex<Transfer>,
}

#[derive(Default)]
struct Transfer {
    file_name: String,
    file: Option<File>,
}

struct Command {
    opcode: u8,
    length: u32,
    unused: u32,
    auth_code: u32,
    data: Vec<u8>,
}

impl Command {
    fn request(opcode: u8, data: Vec<u8>) -> Self {
        Command {
            opcode,
            length: data.len() as u32,
            unused: 0x0,
            auth_code: AUTH_CODE,
            data,
        }
    }
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                transfer: Mutex::new(Transfer::default()),
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

    fn accept(&self) {
        // Ask the agent to identify itself.
        self.inner.send_command(&Command::request(OP_BEACON, Vec::new()));
    }

    fn receive_data(&self, data: &[u8]) {
        debug!("received\n{}", hexdump(data));

        let inner = Arc::clone(&self.inner);
        self.decoder.call_once(move || {
            thread::spawn(move || inner.process_data());
        });

        self.inner.queue.put(data);
    }

    fn execute(&self, name: &str, args: &[String]) {
        let command_line = format!("{} {}", name, args.join(" ")).trim().to_string();

        let mut data = command_line.into_bytes();
        data.push(0x00);
        self.inner.send_command(&Command::request(OP_COMMAND_PIPE, data));
    }

    fn upload(&self, source: &str, destination: &str) {
        let contents = match std::fs::read(source) {
            Ok(b) => b,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        let mut data = destination.as_bytes().to_vec();
        data.push(0x00);
        data.extend_from_slice(&contents);

        self.inner.send_command(&Command::request(OP_FILE_UPLOAD, data));
    }

    fn download(&self, source: &str, destination: &str) {
        self.inner.transfer.lock().unwrap().file_name = destination.to_string();

        let mut data = source.as_bytes().to_vec();
        data.push(0x00);
        self.inner.send_command(&Command::request(OP_FILE_DOWNLOAD, data));
    }

    fn close(&self) {
        let mut transfer = self.inner.transfer.lock().unwrap();
        transfer.file = None;
        transfer.file_name.clear();
        drop(transfer);

        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let header = match self.queue.get(13) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            let mut command = Command {
                opcode: header[0],
                length: u32::from_le_bytes(header[1..5].try_into().unwrap()),
                unused: u32::from_le_bytes(header[5..9].try_into().unwrap()),
                auth_code: u32::from_le_bytes(header[9..13].try_into().unwrap()),
                data: Vec::new(),
            };

            if command.length > 0 {
                let data = match self.queue.get(command.length as usize) {
                    Ok(b) => b,
                    Err(_) => {
                        self.delegate.get().close_connection();
                        return;
                    }
                };

                command.data = cipher(&data);
            }

            self.process_command(command);
        }
    }

    fn process_command(&self, command: Command) {
        log_command(&command);

        match command.opcode {
            OP_BEACON_RESP => {
                let id = hex::encode(Sha256::digest(&command.data));
                self.delegate.get().agent_connected(&id);
            }
            OP_COMMAND_PIPE_RESP => {
                info!("{}", String::from_utf8_lossy(&command.data));
            }
            OP_FILE_UPLOAD_RESP => {
                info!("Upload complete");
            }
            OP_FILE_DOWNLOAD_SIZE => {
                let mut transfer = self.transfer.lock().unwrap();
                match File::create(&transfer.file_name) {
                    Ok(file) => transfer.file = Some(file),
                    Err(e) => warn!("Error opening destination file: {e}"),
                }
            }
            OP_FILE_DOWNLOAD_DATA => {
                let mut transfer = self.transfer.lock().unwrap();
                if let Some(file) = transfer.file.as_mut() {
                    if let Err(e) = file.write_all(&command.data) {
                        warn!("Error writing destination file: {e}");
                    }
                }
            }
            OP_FILE_DOWNLOAD_COMPLETE => {
                let mut transfer = self.transfer.lock().unwrap();
                transfer.file = None;
                transfer.file_name.clear();
                info!("Download complete");
            }
            OP_ERROR => {
                let mut transfer = self.transfer.lock().unwrap();
                transfer.file = None;
                transfer.file_name.clear();
                warn!("{}", String::from_utf8_lossy(&command.data));
            }
            _ => {}
        }
    }

    fn send_command(&self, command: &Command) {
        let mut result = Vec::with_capacity(13 + command.data.len());

        result.push(command.opcode);
        result.extend_from_slice(&command.length.to_le_bytes());
        result.extend_from_slice(&command.unused.to_le_bytes());
        result.extend_from_slice(&command.auth_code.to_le_bytes());

        if command.length > 0 {
            result.extend_from_slice(&cipher(&command.data));
        }

        self.delegate.get().send_data(&result);
    }
}

fn log_command(command: &Command) {
    debug!("Bistromath Command");
    debug!("Opcode: 0x{:x}", command.opcode);
    debug!("Length: 0x{:x}", command.length);
    debug!("Unused: 0x{:04x}", command.unused);
    debug!("  Auth: 0x{:04x}", command.auth_code);
    debug!("  Data:\n{}", hexdump(&command.data));
}

fn cipher(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ 0x77).collect()
}
