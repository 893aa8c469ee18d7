//! Replication Engine Port
//!
//! The engine negotiates documents and revisions over whatever channel
//! it is handed. It is injected, never implemented by the transport.

use crate::domain::entities::{DocumentReplicationEvent, ReplicationConfig};
use crate::domain::ports::message_endpoint::{MessageEndpoint, MessageHandler};
use crate::domain::value_objects::{PeerRole, SessionId};
use crate::error::EngineError;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives document-level replication outcomes from the engine.
pub trait EventSink: Send + Sync {
    fn record(&self, event: DocumentReplicationEvent);
}

/// Everything an engine needs to serve one session.
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    /// Whether the connection was accepted or dialed
    pub role: PeerRole,
    pub config: ReplicationConfig,
    /// Channel to the remote peer
    pub endpoint: Arc<dyn MessageEndpoint>,
    /// Where to report document events
    pub events: Arc<dyn EventSink>,
}

/// Replication engine driven over a message endpoint.
#[async_trait]
pub trait ReplicationEngine: Send + Sync {
    /// Begin replicating for a session.
    ///
    /// Returns the handler that will consume inbound messages for the
    /// session's connection.
    async fn start_replication(
        &self,
        context: SessionContext,
    ) -> Result<Arc<dyn MessageHandler>, EngineError>;
}
