//! Error Types
//!
//! Error taxonomy for the transport, listener and session registry.
//! Transport failures are local to one connection; usage errors are
//! returned synchronously to the caller.

use std::net::SocketAddr;

/// The byte stream could not be split into frames.
///
/// Fatal for the stream it was raised on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Errors raised by a single peer connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the TCP listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener on {addr} failed: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listener is already running")]
    AlreadyStarted,
}

/// Raised by a replication engine that cannot serve a session.
#[derive(Debug, Clone, thiserror::Error)]
#[error("replication engine error: {0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors returned by session binding operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already bound to a session")]
    AlreadyBound(String),
    #[error("connection {0} is not open")]
    ConnectionClosed(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session {0} has been stopped")]
    SessionStopped(String),
    #[error("failed to connect: {0}")]
    Connect(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_display() {
        let err = FramingError::FrameTooLarge { len: 20, max: 10 };
        assert_eq!(err.to_string(), "frame of 20 bytes exceeds maximum of 10 bytes");

        let err = FramingError::UnknownKind(0x7f);
        assert_eq!(err.to_string(), "unknown frame kind 0x7f");
    }

    #[test]
    fn test_transport_error_from_framing() {
        let err: TransportError = FramingError::UnknownKind(9).into();
        assert!(matches!(err, TransportError::Framing(FramingError::UnknownKind(9))));
    }

    #[test]
    fn test_registry_error_from_engine() {
        let err: RegistryError = EngineError::new("no database").into();
        assert_eq!(err.to_string(), "replication engine error: no database");
    }

    #[test]
    fn test_registry_error_from_transport() {
        let err: RegistryError = TransportError::ConnectionClosed.into();
        assert_eq!(err.to_string(), "failed to connect: connection is closed");
    }
}
