use crate::protocol::Delegate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Recording delegate for handler tests. Decode loops run on their own
/// threads, so every accessor that expects activity waits on a condvar
/// with a timeout instead of sleeping.
pub struct RecordingDelegate {
    state: Mutex<Recorded>,
    changed: Condvar,
    closed: AtomicBool,
}

#[derive(Default)]
struct Recorded {
    sent: Vec<Vec<u8>>,
    agents: Vec<String>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        RecordingDelegate {
            state: Mutex::new(Recorded::default()),
            changed: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// All payloads passed to `send_data`, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn agents(&self) -> Vec<String> {
        self.state.lock().unwrap().agents.clone()
    }

    pub fn close_requested(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Block until at least `n` `send_data` calls have been recorded.
    pub fn wait_for_sends(&self, n: usize) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        while state.sent.len() < n {
            let (next, timeout) = self
                .changed
                .wait_timeout(state, Duration::from_secs(5))
                .unwrap();
            state = next;
            if timeout.timed_out() {
                panic!("timed out waiting for {n} sends, saw {}", state.sent.len());
            }
        }
        state.sent.clone()
    }

    /// Block until at least `n` agent registrations have been recorded.
    pub fn wait_for_agents(&self, n: usize) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        while state.agents.len() < n {
            let (next, timeout) = self
                .changed
                .wait_timeout(state, Duration::from_secs(5))
                .unwrap();
            state = next;
            if timeout.timed_out() {
                panic!("timed out waiting for {n} agents, saw {}", state.agents.len());
            }
        }
        state.agents.clone()
    }

    /// Block until the handler asks for the connection to be closed.
    pub fn wait_for_close(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !self.closed.load(Ordering::SeqCst) {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for close_connection");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Delegate for RecordingDelegate {
    fn send_data(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.sent.push(data.to_vec());
        self.changed.notify_all();
    }

    fn agent_connected(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.agents.push(id.to_string());
        self.changed.notify_all();
    }

    fn close_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        self.changed.notify_all();
        drop(state);
    }
}
