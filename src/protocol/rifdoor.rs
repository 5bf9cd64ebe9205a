use crate::hexdump::hexdump;
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::thread;

const BEACON: u32 = 0x9e2;
const REQUEST: u32 = 0x4e3a;
const RESPONSE: u32 = 0xa021;
const END: u32 = 0x1055;

/// Rifdoor protocol handler. Frames are a 16-byte little-endian header
/// (opcode, checksum, zero, size) with a rolling-XOR ciphered payload.
/// The beacon checksum identifies the agent and is echoed back in every
/// request. No file-transfer support in this family.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    checksum: AtomicU32,
}

struct Command {
    opcode: u32,
    checksum: u32,
    zero: u32,
    size: u32,
    data: Vec<u8>,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                checksum: AtomicU32::new(0),
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
        let checksum = self.inner.checksum.load(Ordering::SeqCst);

        let request = Command {
            opcode: REQUEST,
            checksum,
            zero: 0x0,
            size: command_line.len() as u32,
            data: command_line.into_bytes(),
        };
        self.inner.delegate.get().send_data(&encode_command(&request));

        let end = Command {
            opcode: END,
            checksum,
            zero: 0x0,
            size: 0x0,
            data: Vec::new(),
        };
        self.inner.delegate.get().send_data(&encode_command(&end));
    }

    fn upload(&self, _source: &str, _destination: &str) {
        warn!("rifdoor doesn't support file upload");
    }

    fn download(&self, _source: &str, _destination: &str) {
        warn!("rifdoor doesn't support file download");
    }

    fn close(&self) {
        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let header = match self.queue.get(16) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            let mut command = Command {
                opcode: u32::from_le_bytes(header[0..4].try_into().unwrap()),
                checksum: u32::from_le_bytes(header[4..8].try_into().unwrap()),
                zero: u32::from_le_bytes(header[8..12].try_into().unwrap()),
                size: u32::from_le_bytes(header[12..16].try_into().unwrap()),
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

        self.checksum.store(command.checksum, Ordering::SeqCst);

        match command.opcode {
            BEACON => {
                let id = hex::encode(Sha256::digest(command.checksum.to_le_bytes()));
                self.delegate.get().agent_connected(&id);
            }
            RESPONSE => {
                info!("{}", String::from_utf8_lossy(&command.data));
            }
            END => {
                self.delegate.get().close_connection();
            }
            _ => {}
        }
    }
}

fn log_command(command: &Command) {
    debug!("Rifdoor Command");
    debug!("  Opcode: 0x{:08x}", command.opcode);
    debug!("Checksum: 0x{:08x}", command.checksum);
    debug!("    Zero: 0x{:08x}", command.zero);
    debug!("    Size: 0x{:08x}", command.size);
    if !command.data.is_empty() {
        debug!("    Data:\n{}", hexdump(&command.data));
    }
}

fn encode_command(command: &Command) -> Vec<u8> {
    let mut result = Vec::with_capacity(16 + command.data.len());

    result.extend_from_slice(&command.opcode.to_le_bytes());
    result.extend_from_slice(&command.checksum.to_le_bytes());
    result.extend_from_slice(&command.zero.to_le_bytes());
    result.extend_from_slice(&command.size.to_le_bytes());

    if command.size > 0 {
        result.extend_from_slice(&cipher(&command.data));
    }

    result
}

fn byte1(i: u32) -> u32 {
    (i & 0x0000_ff00) >> 8
}

fn byte2(i: u32) -> u32 {
    (i & 0x00ff_0000) >> 16
}

fn hibyte(i: u32) -> u32 {
    (i & 0xff00_0000) >> 24
}

/// Four-constant rolling XOR reverse-engineered from the implant. The
/// register evolution is data-independent, so the transform is its own
/// inverse.
fn cipher(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());

    let mut key1: u32 = 0x1a2c;
    let mut key2: u32 = 0x1a2c;
    let mut key3: u32 = 0x4c5b;

    for &b in input {
        let v6 = (key3
            ^ key2 & byte1(key1)
            ^ b as u32
            ^ byte2(key1) & hibyte(key1)
            ^ byte1(key3) & byte2(key3) & hibyte(key3))
            & 0xff;
        let v7 = key3 >> 8 | key2 << 24;
        key1 = key1 >> 8
            | (key3.wrapping_mul(16)
                ^ (key3 ^ (key3 ^ key3.wrapping_mul(4)).wrapping_mul(2)) & 0xffff_fff0)
                << 20;
        output.push(v6 as u8);
        key2 = key1;
        key3 = v7;
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
        let input: Vec<u8> = (0u8..=255).collect();
        assert_eq!(cipher(&cipher(&input)), input);
    }

    #[test]
    fn test_cipher_changes_bytes() {
        assert_ne!(cipher(b"whoami"), b"whoami".to_vec());
    }

    #[test]
    fn test_beacon_derives_agent_id_from_checksum() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        let mut frame = Vec::new();
        frame.extend_from_slice(&BEACON.to_le_bytes());
        frame.extend_from_slice(&0x1122_3344u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        handler.receive_data(&frame);

        let agents = delegate.wait_for_agents(1);
        let expected = hex::encode(Sha256::digest(0x1122_3344u32.to_le_bytes()));
        assert_eq!(agents[0], expected);
    }

    #[test]
    fn test_execute_echoes_beacon_checksum() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        let mut frame = Vec::new();
        frame.extend_from_slice(&BEACON.to_le_bytes());
        frame.extend_from_slice(&0xabcd_0001u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        handler.receive_data(&frame);
        delegate.wait_for_agents(1);

        handler.execute("dir", &["C:\\".to_string()]);

        let sent = delegate.wait_for_sends(2);

        let request = &sent[0];
        assert_eq!(
            u32::from_le_bytes(request[0..4].try_into().unwrap()),
            REQUEST
        );
        assert_eq!(
            u32::from_le_bytes(request[4..8].try_into().unwrap()),
            0xabcd_0001
        );
        assert_eq!(cipher(&request[16..]), b"dir C:\\".to_vec());

        let end = &sent[1];
        assert_eq!(u32::from_le_bytes(end[0..4].try_into().unwrap()), END);
        assert_eq!(end.len(), 16);
    }

    #[test]
    fn test_end_opcode_closes_connection() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        let mut frame = Vec::new();
        frame.extend_from_slice(&END.to_le_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        handler.receive_data(&frame);

        delegate.wait_for_close();
    }
}
