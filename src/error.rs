use network::{ErrorCode, Message, NetworkError};
use placement::PlacementError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient replicas: {live} live storage nodes, {required} required")]
    InsufficientReplicas { live: usize, required: usize },

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("No live replica holds {0}")]
    NoLiveReplica(String),

    #[error("Quorum timeout for {file}: {acked} of {required} acknowledgements")]
    QuorumTimeout {
        file: String,
        acked: usize,
        required: usize,
    },

    #[error("Malformed request: {0}")]
    Malformed(String),
}

impl From<PlacementError> for ControllerError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::FileExists(file) => ControllerError::FileAlreadyExists(file),
            PlacementError::UnknownFile(file) => ControllerError::FileNotFound(file),
            PlacementError::InvalidTransition { file, .. } => ControllerError::FileNotFound(file),
        }
    }
}

impl ControllerError {
    /// The protocol error a client is told about, if any. Internal failures
    /// and quorum timeouts leave the client without a reply.
    pub fn into_reply(self) -> Option<Message> {
        let code = match self {
            ControllerError::InsufficientReplicas { .. } => ErrorCode::NotEnoughDstores,
            ControllerError::FileAlreadyExists(_) => ErrorCode::FileAlreadyExists,
            ControllerError::FileNotFound(_) => ErrorCode::FileDoesNotExist,
            ControllerError::NoLiveReplica(_) => ErrorCode::Load,
            _ => return None,
        };
        Some(Message::error(code))
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Failures seen by [`crate::Client`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Controller rejected the request: {0:?}")]
    Rejected(ErrorCode),

    #[error("Unexpected reply: {0}")]
    Unexpected(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Connection closed")]
    Closed,
}
