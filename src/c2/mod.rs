pub mod agent;
pub mod cert;
pub mod command;
pub mod server;

pub use agent::{Agent, AgentRegistry};
pub use command::Command;
pub use server::Server;

#[derive(Debug, thiserror::Error)]
pub enum C2Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}
