pub mod bistromath;
pub mod crosswalk;
pub mod generic;
pub mod hotcroissant;
pub mod http;
pub mod mata;
pub mod obliquerat;
pub mod queue;
pub mod rc4;
pub mod redxor;
pub mod rifdoor;
pub mod slickshoes;
#[cfg(test)]
pub mod testutil;
pub mod tigerrat;
pub mod wide;
pub mod yort;

pub use queue::{ByteQueue, QueueClosed};

use std::sync::{Arc, OnceLock};

/// Connection-side callback surface a protocol handler drives: raw bytes
/// out, agent registration, and connection teardown. An empty agent ID
/// tells the connection to derive one from the peer address.
pub trait Delegate: Send + Sync {
    fn send_data(&self, data: &[u8]);
    fn agent_connected(&self, id: &str);
    fn close_connection(&self);
}

/// A protocol state machine capable of speaking one malware family's
/// wire format. One handler instance serves exactly one connection.
///
/// `receive_data` must return immediately; handlers that reassemble
/// frames push into a private ByteQueue and lazily spawn a single
/// decode thread on the first call. `close` releases resources and
/// closes that queue so a parked decode thread unblocks.
pub trait Handler: Send + Sync {
    fn needs_tls(&self) -> bool;
    fn set_delegate(&self, delegate: Arc<dyn Delegate>);
    fn accept(&self);
    fn receive_data(&self, data: &[u8]);
    fn execute(&self, name: &str, args: &[String]);
    fn upload(&self, source: &str, destination: &str);
    fn download(&self, source: &str, destination: &str);
    fn close(&self);
}

/// Write-once slot for the delegate wired in by the connection before
/// any traffic flows.
pub(crate) struct DelegateCell(OnceLock<Arc<dyn Delegate>>);

impl DelegateCell {
    pub fn new() -> Self {
        DelegateCell(OnceLock::new())
    }

    pub fn set(&self, delegate: Arc<dyn Delegate>) {
        let _ = self.0.set(delegate);
    }

    pub fn get(&self) -> &Arc<dyn Delegate> {
        self.0.get().expect("delegate wired before handler use")
    }
}

type HandlerFactory = fn() -> Arc<dyn Handler>;

/// Registry of emulated families. New protocols plug in here; the
/// server only ever sees the `Handler` trait.
static PROTOCOLS: &[(&str, HandlerFactory)] = &[
    ("bistromath", || Arc::new(bistromath::Handler::new())),
    ("crosswalk", || Arc::new(crosswalk::Handler::new())),
    ("generic", || Arc::new(generic::Handler::new())),
    ("hotcroissant", || Arc::new(hotcroissant::Handler::new())),
    ("mata", || Arc::new(mata::Handler::new())),
    ("obliquerat", || Arc::new(obliquerat::Handler::new())),
    ("redxor", || Arc::new(redxor::Handler::new())),
    ("rifdoor", || Arc::new(rifdoor::Handler::new())),
    ("slickshoes", || Arc::new(slickshoes::Handler::new())),
    ("tigerrat", || Arc::new(tigerrat::Handler::new())),
    ("yort", || Arc::new(yort::Handler::new())),
];

/// Build a fresh handler for the named protocol.
pub fn from_name(name: &str) -> Option<Arc<dyn Handler>> {
    PROTOCOLS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, factory)| factory())
}

/// Names of every registered protocol.
pub fn protocol_names() -> Vec<&'static str> {
    PROTOCOLS.iter().map(|(n, _)| *n).collect()
}
