//! Error types for the sync engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse error classification shared with callers that only need to branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidArgument,
    SocketError,
    ConnectFailed,
    Timeout,
    ProtocolViolation,
    JsonParseFailure,
    AuthFailure,
    WriteFailure,
    StorageFailure,
    PeerDisconnected,
    Cancelled,
    Busy,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json parse error: {0}")]
    JsonParse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("write failed: {0}")]
    Write(std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("peer disconnected")]
    Disconnected,

    #[error("cancelled")]
    Cancelled,

    #[error("busy")]
    Busy,

    #[error("rejected: {0}")]
    Rejected(#[from] ValidationError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::OutOfMemory => ErrorKind::OutOfMemory,
            SyncError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SyncError::Socket(_) => ErrorKind::SocketError,
            SyncError::ConnectFailed(_) => ErrorKind::ConnectFailed,
            SyncError::Timeout => ErrorKind::Timeout,
            SyncError::Protocol(_) | SyncError::Rejected(_) => ErrorKind::ProtocolViolation,
            SyncError::JsonParse(_) => ErrorKind::JsonParseFailure,
            SyncError::Auth(_) => ErrorKind::AuthFailure,
            SyncError::Write(_) => ErrorKind::WriteFailure,
            SyncError::Storage(_) => ErrorKind::StorageFailure,
            SyncError::Disconnected => ErrorKind::PeerDisconnected,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Busy => ErrorKind::Busy,
        }
    }

    /// Transport-level failures leave the byte stream in an unknown position;
    /// the session cannot continue after one of these.
    pub fn is_fatal_to_link(&self) -> bool {
        matches!(
            self,
            SyncError::Socket(_)
                | SyncError::Timeout
                | SyncError::Protocol(_)
                | SyncError::JsonParse(_)
                | SyncError::Disconnected
        )
    }
}

/// Peer-supplied input that failed local policy. Reported back to the peer as an ERROR message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty path")]
    EmptyPath,

    #[error("absolute path not allowed: {0}")]
    AbsolutePath(String),

    #[error("path traversal not allowed: {0}")]
    Traversal(String),

    #[error("path too long: {len} bytes (max {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("extension not accepted: {0}")]
    Extension(String),

    #[error("invalid size: {size} bytes (max {max})")]
    Size { size: u64, max: u64 },

    #[error("deleting books is not permitted")]
    DeleteNotPermitted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_protocol_violation() {
        let e: SyncError = ValidationError::EmptyPath.into();
        assert_eq!(e.kind(), ErrorKind::ProtocolViolation);
        assert!(!e.is_fatal_to_link());
    }

    #[test]
    fn transport_errors_are_fatal() {
        assert!(SyncError::Disconnected.is_fatal_to_link());
        assert!(SyncError::Timeout.is_fatal_to_link());
        assert!(!SyncError::Cancelled.is_fatal_to_link());
        assert!(!SyncError::Busy.is_fatal_to_link());
    }

    #[test]
    fn io_error_is_socket_kind() {
        let e: SyncError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(e.kind(), ErrorKind::SocketError);
        assert_eq!(e.to_string(), "socket error: boom");
    }
}
