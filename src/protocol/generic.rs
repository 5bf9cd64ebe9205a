use crate::hexdump::hexdump;
use crate::protocol::{Delegate, DelegateCell};
use log::{debug, warn};
use std::sync::Arc;

/// Floor-of-behavior handler: no framing, no replies. Every received
/// chunk is logged and treated as a beacon so unknown implants still
/// show up in the agent registry under a peer-address identity.
pub struct Handler {
    delegate: DelegateCell,
}

impl Handler {
    pub fn new() -> Self {
        Handler {
            delegate: DelegateCell::new(),
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
        self.delegate.set(delegate);
    }

    fn accept(&self) {}

    fn receive_data(&self, data: &[u8]) {
        debug!("received\n{}", hexdump(data));

        self.delegate.get().agent_connected("");
    }

    fn execute(&self, _name: &str, _args: &[String]) {
        warn!("generic doesn't support command execution");
    }

    fn upload(&self, _source: &str, _destination: &str) {
        warn!("generic doesn't support file upload");
    }

    fn download(&self, _source: &str, _destination: &str) {
        warn!("generic doesn't support file download");
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::RecordingDelegate;
    use crate::protocol::Handler as _;

    #[test]
    fn test_every_chunk_is_a_beacon() {
        let handler = Handler::new();
        let delegate = Arc::new(RecordingDelegate::new());
        handler.set_delegate(delegate.clone());

        handler.receive_data(b"hello");
        handler.receive_data(b"world");

        assert_eq!(delegate.agents(), vec!["", ""]);
        assert!(delegate.sent().is_empty());
        assert!(!delegate.close_requested());
    }
}
