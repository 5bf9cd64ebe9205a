use serde::{Deserialize, Serialize};

/// Operator intent, protocol-agnostic. Each handler either encodes a
/// command into its family's wire format or logs that the family has no
/// equivalent, without touching the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Execute { name: String, args: Vec<String> },
    Upload { source: String, destination: String },
    Download { source: String, destination: String },
}
