//! Message Endpoint Port
//!
//! The duplex, message-oriented channel a replication engine talks
//! through. The transport implements [`MessageEndpoint`]; the engine
//! implements [`MessageHandler`] to consume what arrives.

use crate::domain::value_objects::{CloseReason, ConnectionId, ConnectionState};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

/// Outbound half of a message channel.
///
/// Payloads are opaque; the transport never interprets them.
#[async_trait]
pub trait MessageEndpoint: Send + Sync {
    /// Identifier of the underlying connection.
    fn id(&self) -> ConnectionId;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Send one message. Concurrent calls never interleave on the wire.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] unless the
    /// connection is open.
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;

    /// Close the channel. Closing twice is a no-op.
    async fn close(&self, reason: CloseReason);
}

/// Inbound half of a message channel, registered by the engine.
///
/// Callbacks run on the connection's read task and must not block. A
/// callback may replace or clear the connection's handler; messages that
/// arrive with no handler are queued for the next one.
pub trait MessageHandler: Send + Sync {
    /// A complete message arrived. Called in wire order.
    fn on_receive(&self, message: Bytes);

    /// The channel ended. Called exactly once, after which no other
    /// callback is made.
    fn on_close(&self, reason: &CloseReason);

    /// The session was stopped while the connection stays open.
    fn on_unbind(&self) {}
}
