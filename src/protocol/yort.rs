use crate::hexdump::hexdump;
use crate::protocol::http::{read_request, simple_response, HttpError, Request};
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;

const XOR_KEY: u8 = 0xaa;

// Command opcodes the agent understands once it reports ready: sleep
// 0x2, die 0x3, transfer ack 0x5, system info 0xb, keep-alive 0xc,
// get/set config 0xe/0xf, shell 0x12/0x13, file fetch 0x15.
const CMD_TRANSFER_ACK: u32 = 0x5;
const CMD_SYSTEM_INFO: u32 = 0xb;

/// Yort protocol handler. The agent speaks HTTP over TLS, identifying
/// each exchange with the `_webident_f` (session) and `_webident_s`
/// (state) form values; uploads arrive as multipart `file` parts
/// XOR-ciphered with 0xaa, and commands go back as ciphered 12-byte
/// frames inside plain 200 responses.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    download_started: AtomicBool,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                download_started: AtomicBool::new(false),
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
        true
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

    fn execute(&self, _name: &str, _args: &[String]) {
        warn!("yort doesn't support command execution");
    }

    fn upload(&self, _source: &str, _destination: &str) {
        warn!("yort doesn't support file upload");
    }

    fn download(&self, _source: &str, _destination: &str) {
        warn!("yort doesn't support file download");
    }

    fn close(&self) {
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
                    warn!("Yort error reading request: {e}");
                    self.delegate.get().close_connection();
                    return;
                }
            };

            self.process_request(&request);
        }
    }

    fn process_request(&self, request: &Request) {
        let sessid = request.form_value("_webident_f").unwrap_or_default();
        let value = request.form_value("_webident_s").unwrap_or_default();

        debug!("Session ID: {sessid} Value: {value}");

        match value.as_str() {
            "16" => {
                debug!("Session created");

                self.send_http_response(b"1");
            }
            "17" => {
                debug!("Session destroyed");

                self.send_http_response(b"1");
            }
            "20" | "21" => {
                debug!("Data received");

                let file = match request.form_file("file") {
                    Some(f) => f,
                    None => {
                        debug!("No file form value");
                        return;
                    }
                };

                debug!("File name {}", file.filename);

                let decrypted = cipher(&file.data);
                debug!("{}", hexdump(&decrypted));

                if value == "21" {
                    debug!("Skipping response");
                } else if decrypted.first() == Some(&0x05) {
                    if self.download_started.swap(false, Ordering::SeqCst) {
                        // Only a started download needs the offset.
                        self.send_command(CMD_TRANSFER_ACK, &[0x00, 0x00, 0x00, 0x00]);
                    } else {
                        self.send_command(CMD_TRANSFER_ACK, &[]);
                    }
                } else {
                    self.send_command(CMD_TRANSFER_ACK, &[]);
                }
            }
            "22" => {
                debug!("Ready for commands");
                self.send_command(CMD_SYSTEM_INFO, &[]);
            }
            _ => {}
        }
    }

    fn send_http_response(&self, data: &[u8]) {
        self.delegate.get().send_data(&simple_response(data));
    }

    fn send_command(&self, opcode: u32, data: &[u8]) {
        let mut command = Vec::with_capacity(12 + data.len());
        command.extend_from_slice(&opcode.to_le_bytes());
        command.extend_from_slice(&0u32.to_le_bytes());
        command.extend_from_slice(&(data.len() as u32).to_le_bytes());
        command.extend_from_slice(data);

        let encrypted = cipher(&command);

        self.send_http_response(&encrypted);
    }
}

fn cipher(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ XOR_KEY).collect()
}
