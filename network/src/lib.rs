mod framing;
mod messages;
mod node;
mod registry;

pub use framing::{read_line, write_message, MAX_LINE_BYTES};
pub use messages::{ErrorCode, Message, RebalanceInstruction};
pub use node::{BoxedWriter, StorageNode, INBOX_CAPACITY};
pub use registry::NodeRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A storage node is identified by the port it accepts client connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(NodeId)
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage node {0} is dead")]
    DeadNode(NodeId),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}
