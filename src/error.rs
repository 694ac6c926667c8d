//! Error types shared by the codec, the client facade and federation links.
//!
//! Server plumbing uses `anyhow` for propagation; this enum is the typed
//! surface callers match on.

use std::time::Duration;

use crate::protocol::Status;

/// Errors surfaced by wire operations and the client facade.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Socket read/write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// The byte stream can no longer be parsed (oversized line, short payload).
    /// The connection must be torn down.
    #[error("framing error: {0}")]
    Framing(String),

    /// A malformed message or field. The connection stays usable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered `ACK|ER1`.
    #[error("key not found")]
    KeyNotFound,

    /// The server answered `ACK|FAI`.
    #[error("operation failed")]
    OperationFailed,

    /// A message of another type arrived where a specific type was expected,
    /// or the server answered `ACK|ER3`.
    #[error("wrong message type: {0}")]
    WrongMessageType(String),

    /// The server answered `ACK|ER2`.
    #[error("payload read failed on remote side")]
    ReadFailed,

    /// The handshake was refused (for clients: the server's client cap was reached).
    #[error("connection rejected by server")]
    Rejected,

    /// The facade has no live connection.
    #[error("not connected")]
    NotConnected,

    /// A declared payload length exceeds the configured bound.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Declared size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// A bounded read or round trip did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Result alias for wire and client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a non-success acknowledgement status to its error value.
    ///
    /// Returns `None` for [`Status::Success`].
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Success => None,
            Status::Failure => Some(Error::OperationFailed),
            Status::ExistsError => Some(Error::KeyNotFound),
            Status::ReadError => Some(Error::ReadFailed),
            Status::WrongTypeError => Some(Error::WrongMessageType(
                "remote rejected message type".to_string(),
            )),
        }
    }

    /// Whether this error leaves the underlying stream unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Closed | Error::Framing(_) | Error::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(Error::from_status(Status::Success).is_none());
        assert!(matches!(
            Error::from_status(Status::ExistsError),
            Some(Error::KeyNotFound)
        ));
        assert!(matches!(
            Error::from_status(Status::Failure),
            Some(Error::OperationFailed)
        ));
        assert!(matches!(
            Error::from_status(Status::ReadError),
            Some(Error::ReadFailed)
        ));
        assert!(matches!(
            Error::from_status(Status::WrongTypeError),
            Some(Error::WrongMessageType(_))
        ));
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::Closed.is_transport());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transport());
        assert!(Error::Framing("short".into()).is_transport());
        assert!(!Error::KeyNotFound.is_transport());
        assert!(!Error::Protocol("bad count".into()).is_transport());
    }
}
