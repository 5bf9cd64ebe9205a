use crate::hexdump::hexdump;
use crate::protocol::rc4::Rc4;
use crate::protocol::wide::{decode_wide_string, encode_wide_string};
use crate::protocol::{ByteQueue, Delegate, DelegateCell, QueueClosed};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    WaitingForBeacon1,
    WaitingForBeacon3,
    BeaconReceived,
    WaitingForKeyLength,
    WaitingForKey,
    HandshakeComplete,
}

const OP_NONE: u32 = 0x00000000;
const OP_BEACON1: u32 = 0x00020000;
const OP_BEACON2: u32 = 0x00020100;
const OP_BEACON3: u32 = 0x00020200;
const OP_SEND_RC4: u32 = 0x00020300;
const OP_SUCCESS: u32 = 0x00020500;
const OP_FAILURE: u32 = 0x00020600;
const OP_HOST_INFO: u32 = 0x00000700;
const OP_EXECUTE: u32 = 0x00010000;
#[allow(dead_code)]
const OP_REVERSE_EXECUTE: u32 = 0x00010002;
const OP_FILE_UPLOAD: u32 = 0x00010100;
const OP_FILE_DOWNLOAD: u32 = 0x00010101;
#[allow(dead_code)]
const OP_FILE_DELETE: u32 = 0x00010103;
#[allow(dead_code)]
const OP_FILE_SCAN_DIR: u32 = 0x00010104;
#[allow(dead_code)]
const OP_FILE_URL_GET: u32 = 0x00010110;

const UPLOAD_CHUNK_SIZE: usize = 0x4000;

/// Number of data packets either side may send before stopping for an
/// explicit acknowledgement.
const TRANSFER_BLOCK_WINDOW: u32 = 16;

/// Mata protocol handler. An explicit opcode handshake exchanges an RC4
/// key; afterwards every packet is a 12-byte little-endian header plus
/// payload, each direction ciphered by its own keystream. Commands are
/// single-slot: issuing a new one replaces whatever was pending.
pub struct Handler {
    inner: Arc<Inner>,
    decoder: Once,
}

struct Inner {
    delegate: DelegateCell,
    queue: ByteQueue,
    state: Mutex<State>,
}

struct State {
    phase: Phase,
    key_length: u32,
    send_cipher: Option<Rc4>,
    recv_cipher: Option<Rc4>,
    pending_command: u32,
    active_command: u32,
    file: Option<File>,
    block_counter: u32,
    upload_finished: bool,
}

struct Command {
    opcode: u32,
    size: u32,
    unknown: u32,
    data: Vec<u8>,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            inner: Arc::new(Inner {
                delegate: DelegateCell::new(),
                queue: ByteQueue::new(),
                state: Mutex::new(State {
                    phase: Phase::WaitingForBeacon1,
                    key_length: 0,
                    send_cipher: None,
                    recv_cipher: None,
                    pending_command: OP_NONE,
                    active_command: OP_NONE,
                    file: None,
                    block_counter: 0,
                    upload_finished: false,
                }),
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

    fn execute(&self, name: &str, args: &[String]) {
        let command_line =
            encode_wide_string(format!("{} {}", name, args.join(" ")).trim());

        let mut data = command_line;
        data.extend_from_slice(&[0x00, 0x00]);

        let mut state = self.inner.state.lock().unwrap();
        self.inner.send_packet(
            &mut state,
            &Command {
                opcode: OP_EXECUTE,
                size: 0,
                unknown: 0x0,
                data,
            },
        );
        state.pending_command = OP_EXECUTE;
    }

    fn upload(&self, source: &str, destination: &str) {
        let file = match File::open(source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        let mut dest = encode_wide_string(destination);
        dest.extend_from_slice(&[0x00, 0x00]);

        let mut state = self.inner.state.lock().unwrap();
        state.file = Some(file);
        self.inner.send_packet(
            &mut state,
            &Command {
                opcode: OP_FILE_UPLOAD,
                size: 0,
                unknown: 0x0,
                data: dest,
            },
        );
        state.pending_command = OP_FILE_UPLOAD;
        state.upload_finished = false;
        state.block_counter = 0;
    }

    fn download(&self, source: &str, destination: &str) {
        let file = match File::create(destination) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening destination file: {e}");
                return;
            }
        };

        let mut src = encode_wide_string(source);
        src.extend_from_slice(&[0x00, 0x00]);

        let mut state = self.inner.state.lock().unwrap();
        state.file = Some(file);
        self.inner.send_packet(
            &mut state,
            &Command {
                opcode: OP_FILE_DOWNLOAD,
                size: 0,
                unknown: 0x0,
                data: src,
            },
        );
        state.pending_command = OP_FILE_DOWNLOAD;
        state.block_counter = 0;
    }

    fn close(&self) {
        self.inner.state.lock().unwrap().file = None;
        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let phase = self.state.lock().unwrap().phase;

            match phase {
                Phase::WaitingForBeacon1 => {
                    let opcode = match self.read_opcode() {
                        Ok(op) => op,
                        Err(_) => return self.abort(),
                    };
                    if opcode != OP_BEACON1 {
                        return self.abort();
                    }

                    self.send_opcode(OP_BEACON2);

                    self.state.lock().unwrap().phase = Phase::WaitingForBeacon3;
                }
                Phase::WaitingForBeacon3 => {
                    let opcode = match self.read_opcode() {
                        Ok(op) => op,
                        Err(_) => return self.abort(),
                    };
                    if opcode != OP_BEACON3 {
                        return self.abort();
                    }

                    self.state.lock().unwrap().phase = Phase::BeaconReceived;
                }
                Phase::BeaconReceived => {
                    let command = match self.recv_packet() {
                        Ok(c) => c,
                        Err(_) => return self.abort(),
                    };
                    if command.opcode != OP_SEND_RC4 {
                        return self.abort();
                    }

                    self.state.lock().unwrap().phase = Phase::WaitingForKeyLength;
                }
                Phase::WaitingForKeyLength => {
                    let b = match self.queue.get(4) {
                        Ok(b) => b,
                        Err(_) => return self.abort(),
                    };

                    let mut state = self.state.lock().unwrap();
                    state.key_length = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    state.phase = Phase::WaitingForKey;
                }
                Phase::WaitingForKey => {
                    let key_length = self.state.lock().unwrap().key_length;
                    let key = match self.queue.get(key_length as usize) {
                        Ok(b) => b,
                        Err(_) => return self.abort(),
                    };

                    if key.is_empty() {
                        warn!("mata rc4 error: empty key");
                        return self.abort();
                    }

                    let mut state = self.state.lock().unwrap();

                    // Independent instances per direction so the two
                    // keystreams stay aligned with the peer's.
                    state.send_cipher = Some(Rc4::new(&key));
                    state.recv_cipher = Some(Rc4::new(&key));
                    state.phase = Phase::HandshakeComplete;

                    // Request host info
                    self.send_packet(
                        &mut state,
                        &Command {
                            opcode: OP_HOST_INFO,
                            size: 0,
                            unknown: 0,
                            data: Vec::new(),
                        },
                    );
                }
                Phase::HandshakeComplete => {
                    let command = match self.recv_packet() {
                        Ok(c) => c,
                        Err(_) => return self.abort(),
                    };

                    self.process_command(command);
                }
            }

            self.delegate.get().agent_connected("");
        }
    }

    fn abort(&self) {
        self.delegate.get().close_connection();
    }

    fn read_opcode(&self) -> Result<u32, QueueClosed> {
        let b = self.queue.get(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn send_opcode(&self, opcode: u32) {
        self.delegate.get().send_data(&opcode.to_le_bytes());
    }

    /// Serialise and send one packet: 12-byte header, then the payload,
    /// both ciphered once the handshake is complete. The caller holds
    /// the state lock so header and payload keystream bytes stay
    /// contiguous even when the decode thread and an operator command
    /// send concurrently.
    fn send_packet(&self, state: &mut MutexGuard<'_, State>, command: &Command) {
        debug!("sent");
        log_command(command);

        let mut header = [0u8; 12];
        header[0..4].copy_from_slice(&command.opcode.to_le_bytes());
        header[4..8].copy_from_slice(&(command.data.len() as u32).to_le_bytes());
        header[8..12].copy_from_slice(&command.unknown.to_le_bytes());

        if state.phase == Phase::HandshakeComplete {
            if let Some(cipher) = state.send_cipher.as_mut() {
                cipher.apply_keystream(&mut header);
            }
        }

        self.delegate.get().send_data(&header);

        if !command.data.is_empty() {
            let mut data = command.data.clone();

            if state.phase == Phase::HandshakeComplete {
                if let Some(cipher) = state.send_cipher.as_mut() {
                    cipher.apply_keystream(&mut data);
                }
            }

            self.delegate.get().send_data(&data);
        }
    }

    fn recv_packet(&self) -> Result<Command, QueueClosed> {
        let mut header = self.queue.get(12)?;

        {
            let mut state = self.state.lock().unwrap();
            if state.phase == Phase::HandshakeComplete {
                if let Some(cipher) = state.recv_cipher.as_mut() {
                    cipher.apply_keystream(&mut header);
                }
            }
        }

        let mut command = Command {
            opcode: u32::from_le_bytes([header[0], header[1], header[2], header[3]]),
            size: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
            unknown: u32::from_le_bytes([header[8], header[9], header[10], header[11]]),
            data: Vec::new(),
        };

        if command.size > 0 {
            let mut data = self.queue.get(command.size as usize)?;

            let mut state = self.state.lock().unwrap();
            if state.phase == Phase::HandshakeComplete {
                if let Some(cipher) = state.recv_cipher.as_mut() {
                    cipher.apply_keystream(&mut data);
                }
            }

            command.data = data;
        }

        Ok(command)
    }

    fn process_command(&self, command: Command) {
        debug!("received");
        log_command(&command);

        let mut state = self.state.lock().unwrap();

        match state.active_command {
            OP_EXECUTE => self.process_execute(&mut state, command),
            OP_FILE_DOWNLOAD => self.process_download(&mut state, command),
            OP_FILE_UPLOAD => self.process_upload(&mut state, command),
            _ => match command.opcode {
                OP_SUCCESS => {
                    state.active_command = state.pending_command;
                    state.pending_command = OP_NONE;
                    info!("mata command acknowledged");
                }
                OP_FAILURE => {
                    state.pending_command = OP_NONE;
                    warn!("mata command failed");
                }
                _ => {}
            },
        }
    }

    fn process_execute(&self, state: &mut MutexGuard<'_, State>, command: Command) {
        if command.unknown == 0x2 {
            info!("{}", decode_wide_string(&command.data));
        } else if command.unknown == 0x1 {
            state.active_command = OP_NONE;
            info!("mata command succeeded");
        }
    }

    fn process_download(&self, state: &mut MutexGuard<'_, State>, command: Command) {
        if command.unknown == 0x0 {
            if command.size == 4 {
                // Send the file offset to the agent
                let offset = 0u32.to_le_bytes().to_vec();
                self.send_packet(
                    state,
                    &Command {
                        opcode: OP_SUCCESS,
                        size: 0,
                        unknown: 0x0,
                        data: offset,
                    },
                );
            }
            // An 8-byte payload carries the file modification
            // timestamp, which is ignored.
        } else if command.unknown == 0x2 {
            if let Some(file) = state.file.as_mut() {
                if let Err(e) = file.write_all(&command.data) {
                    warn!("Error writing destination file: {e}");
                }
            }

            state.block_counter += 1;
            if state.block_counter == TRANSFER_BLOCK_WINDOW {
                state.block_counter = 0;
                self.send_packet(
                    state,
                    &Command {
                        opcode: OP_SUCCESS,
                        size: 0,
                        unknown: 0,
                        data: Vec::new(),
                    },
                );
            }
        } else if command.unknown == 0x1 {
            state.file = None;
            state.active_command = OP_NONE;
            state.block_counter = 0;

            self.send_packet(
                state,
                &Command {
                    opcode: OP_SUCCESS,
                    size: 0,
                    unknown: 0,
                    data: Vec::new(),
                },
            );
            info!("mata command succeeded");
        }
    }

    fn process_upload(&self, state: &mut MutexGuard<'_, State>, command: Command) {
        if command.unknown != 0x0 {
            return;
        }

        if command.size == 0 {
            if state.upload_finished {
                // Agent acknowledged our end of file; close our side.
                state.file = None;
                state.active_command = OP_NONE;
                state.block_counter = 0;

                info!("mata command succeeded");
            } else {
                self.send_file_chunks(state);
            }
        } else if command.size == 4 {
            // Send the file offset, then the file itself.
            let offset = 0u32.to_le_bytes().to_vec();
            self.send_packet(
                state,
                &Command {
                    opcode: OP_SUCCESS,
                    size: 0,
                    unknown: 0x0,
                    data: offset,
                },
            );

            self.send_file_chunks(state);
        }
    }

    /// Stream up to one block window of file chunks, pausing for the
    /// agent's acknowledgement every sixteen packets.
    fn send_file_chunks(&self, state: &mut MutexGuard<'_, State>) {
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];

        loop {
            let bytes_read = match state.file.as_mut() {
                Some(file) => match file.read(&mut buf) {
                    Ok(0) => {
                        state.upload_finished = true;
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Error reading source file: {e}");
                        state.upload_finished = true;
                        break;
                    }
                },
                None => {
                    state.upload_finished = true;
                    break;
                }
            };

            let chunk = buf[..bytes_read].to_vec();
            self.send_packet(
                state,
                &Command {
                    opcode: OP_SUCCESS,
                    size: 0,
                    unknown: 0x2,
                    data: chunk,
                },
            );

            state.block_counter += 1;
            if state.block_counter == TRANSFER_BLOCK_WINDOW {
                // Break so the agent can acknowledge the block.
                state.block_counter = 0;
                break;
            }
        }

        if state.upload_finished {
            self.send_packet(
                state,
                &Command {
                    opcode: OP_SUCCESS,
                    size: 0,
                    unknown: 0x1,
                    data: Vec::new(),
                },
            );
        }
    }
}

fn log_command(command: &Command) {
    debug!("Mata Command");
    debug!(" Opcode: 0x{:08x}", command.opcode);
    debug!("   Size: 0x{:08x}", command.size);
    debug!("Unknown: 0x{:08x}", command.unknown);
    if !command.data.is_empty() {
        debug!("   Data:\n{}", hexdump(&command.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::RecordingDelegate;
    use crate::protocol::Handler as _;
    use std::time::Duration;

    fn handler_with_delegate() -> (Handler, Arc<RecordingDelegate>) {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());
        (handler, delegate)
    }

    /// Drive the full handshake with the given RC4 key and return
    /// keystreams aligned with the handler's receive and send ciphers
    /// (the host-info request it emits on completion is consumed here).
    fn complete_handshake(handler: &Handler, delegate: &RecordingDelegate, key: &[u8]) -> (Rc4, Rc4) {
        handler.receive_data(&OP_BEACON1.to_le_bytes());
        delegate.wait_for_sends(1);

        handler.receive_data(&OP_BEACON3.to_le_bytes());

        let mut send_rc4 = [0u8; 12];
        send_rc4[0..4].copy_from_slice(&OP_SEND_RC4.to_le_bytes());
        handler.receive_data(&send_rc4);

        handler.receive_data(&(key.len() as u32).to_le_bytes());
        handler.receive_data(key);

        // Host-info request confirms the handshake finished.
        let sent = delegate.wait_for_sends(2);
        assert_eq!(sent[0], OP_BEACON2.to_le_bytes().to_vec());

        let their_send = Rc4::new(key);
        let mut their_recv = Rc4::new(key);
        let header = their_recv.process(&sent[1]);
        assert_eq!(
            u32::from_le_bytes(header[0..4].try_into().unwrap()),
            OP_HOST_INFO
        );
        assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), 0);

        (their_send, their_recv)
    }

    #[test]
    fn test_beacon1_produces_exactly_one_beacon2() {
        let (handler, delegate) = handler_with_delegate();

        handler.receive_data(&OP_BEACON1.to_le_bytes());

        let sent = delegate.wait_for_sends(1);
        assert_eq!(sent[0], OP_BEACON2.to_le_bytes().to_vec());

        // No further traffic until the next handshake token arrives.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(delegate.sent().len(), 1);
        assert!(!delegate.close_requested());
    }

    #[test]
    fn test_unexpected_opcode_in_handshake_closes() {
        let (handler, delegate) = handler_with_delegate();

        handler.receive_data(&0xdeadbeefu32.to_le_bytes());

        delegate.wait_for_close();
    }

    #[test]
    fn test_unexpected_beacon3_closes() {
        let (handler, delegate) = handler_with_delegate();

        handler.receive_data(&OP_BEACON1.to_le_bytes());
        delegate.wait_for_sends(1);
        handler.receive_data(&OP_BEACON1.to_le_bytes());

        delegate.wait_for_close();
    }

    #[test]
    fn test_handshake_completes_and_requests_host_info() {
        let (handler, delegate) = handler_with_delegate();
        complete_handshake(&handler, &delegate, b"sekrit-key");

        // Exactly the Beacon2 reply and the host-info request.
        assert_eq!(delegate.sent().len(), 2);
        assert!(!delegate.close_requested());
    }

    #[test]
    fn test_execute_single_pending_slot() {
        let (handler, delegate) = handler_with_delegate();
        let (mut their_send, mut their_recv) =
            complete_handshake(&handler, &delegate, b"k");

        handler.execute("whoami", &[]);

        // Header + payload arrive as separate writes.
        let sent = delegate.wait_for_sends(4);
        let header = their_recv.process(&sent[2]);
        assert_eq!(
            u32::from_le_bytes(header[0..4].try_into().unwrap()),
            OP_EXECUTE
        );
        let payload = their_recv.process(&sent[3]);
        assert_eq!(payload, {
            let mut expected = encode_wide_string("whoami");
            expected.extend_from_slice(&[0x00, 0x00]);
            expected
        });

        // Agent acks; the pending slot becomes the active command.
        let mut ack = [0u8; 12];
        ack[0..4].copy_from_slice(&OP_SUCCESS.to_le_bytes());
        handler.receive_data(&their_send.process(&ack));

        // Command output (unknown = 2) is wide-decoded and logged;
        // completion (unknown = 1) releases the slot. Feed completion
        // and verify a second execute still goes out.
        let mut done = [0u8; 12];
        done[0..4].copy_from_slice(&OP_SUCCESS.to_le_bytes());
        done[8..12].copy_from_slice(&1u32.to_le_bytes());
        handler.receive_data(&their_send.process(&done));

        handler.execute("id", &[]);
        delegate.wait_for_sends(6);
    }

    #[test]
    fn test_download_block_window_acks_every_sixteen_packets() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let (handler, delegate) = handler_with_delegate();
        let (mut their_send, mut their_recv) =
            complete_handshake(&handler, &delegate, b"dl-key");

        handler.download("C:\\remote.bin", dest.to_str().unwrap());
        let sent = delegate.wait_for_sends(4); // header + wide source path
        let header = their_recv.process(&sent[2]);
        assert_eq!(
            u32::from_le_bytes(header[0..4].try_into().unwrap()),
            OP_FILE_DOWNLOAD
        );
        let _ = their_recv.process(&sent[3]);

        // Agent acks the command, promoting it to active.
        let mut ack = [0u8; 12];
        ack[0..4].copy_from_slice(&OP_SUCCESS.to_le_bytes());
        handler.receive_data(&their_send.process(&ack));

        // Sixteen data packets: the handler must answer with exactly
        // one block acknowledgement.
        for i in 0u8..16 {
            let mut header = [0u8; 12];
            header[4..8].copy_from_slice(&1u32.to_le_bytes());
            header[8..12].copy_from_slice(&2u32.to_le_bytes());
            handler.receive_data(&their_send.process(&header));
            handler.receive_data(&their_send.process(&[i]));
        }

        let sent = delegate.wait_for_sends(5);
        let block_ack = their_recv.process(&sent[4]);
        assert_eq!(
            u32::from_le_bytes(block_ack[0..4].try_into().unwrap()),
            OP_SUCCESS
        );

        // Completion closes the file and acks once more.
        let mut done = [0u8; 12];
        done[8..12].copy_from_slice(&1u32.to_le_bytes());
        handler.receive_data(&their_send.process(&done));
        delegate.wait_for_sends(6);

        let contents = std::fs::read(&dest).unwrap();
        assert_eq!(contents, (0u8..16).collect::<Vec<_>>());
    }
}
