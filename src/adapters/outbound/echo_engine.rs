//! Echo Engine
//!
//! A loopback [`ReplicationEngine`] for exercising the transport end to
//! end. Each inbound message is read as a document: a JSON object with an
//! `_id` (and optional `_flags`), or a bare UTF-8 document ID. Documents
//! that pass the session's pull rules are recorded and acknowledged with
//! `{"ack": "<id>"}`. Seeded documents are pushed when the session starts.

use crate::domain::entities::{Document, DocumentReplicationEvent, ReplicationConfig};
use crate::domain::ports::{EventSink, MessageEndpoint, MessageHandler, ReplicationEngine, SessionContext};
use crate::domain::value_objects::{CloseReason, DocumentFlags, SessionId};
use crate::error::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

const ID_KEY: &str = "_id";
const FLAGS_KEY: &str = "_flags";

/// Loopback replication engine.
#[derive(Debug, Default, Clone)]
pub struct EchoEngine {
    documents: Vec<(Document, DocumentFlags)>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a local document, pushed to push-enabled sessions on start.
    pub fn with_document(mut self, document: Document, flags: DocumentFlags) -> Self {
        self.documents.push((document, flags));
        self
    }
}

#[async_trait]
impl ReplicationEngine for EchoEngine {
    async fn start_replication(
        &self,
        context: SessionContext,
    ) -> Result<Arc<dyn MessageHandler>, EngineError> {
        if context.config.database.is_empty() {
            return Err(EngineError::new("no database configured"));
        }

        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(context.session_id, context.endpoint.clone(), rx));

        if context.config.replicator_type.is_push() {
            for (document, flags) in &self.documents {
                if !context.config.should_push(document, *flags) {
                    tracing::debug!("session {} filtered push of {}", context.session_id, document.id);
                    continue;
                }
                if outbound.send(encode_document(document, *flags)).is_ok() {
                    context
                        .events
                        .record(DocumentReplicationEvent::new(document.id.clone(), true, *flags));
                }
            }
        }

        tracing::debug!(
            "echo engine serving session {} ({}, continuous: {})",
            context.session_id,
            context.config.replicator_type,
            context.config.continuous
        );

        Ok(Arc::new(EchoHandler {
            session_id: context.session_id,
            config: context.config,
            events: context.events,
            outbound: parking_lot::Mutex::new(Some(outbound)),
        }))
    }
}

/// Writes queued replies in order; ends when the handler lets go.
async fn forward(
    session_id: SessionId,
    endpoint: Arc<dyn MessageEndpoint>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = endpoint.send(message).await {
            tracing::debug!("session {} reply dropped: {}", session_id, e);
            break;
        }
    }
}

struct EchoHandler {
    session_id: SessionId,
    config: ReplicationConfig,
    events: Arc<dyn EventSink>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl EchoHandler {
    fn reply(&self, message: Bytes) {
        if let Some(outbound) = self.outbound.lock().as_ref() {
            let _ = outbound.send(message);
        }
    }
}

impl MessageHandler for EchoHandler {
    fn on_receive(&self, message: Bytes) {
        let (document, flags) = match parse_document(&message) {
            Some(parsed) => parsed,
            None => return,
        };

        if !self.config.should_pull(&document, flags) {
            tracing::debug!("session {} filtered pull of {}", self.session_id, document.id);
            return;
        }

        self.events
            .record(DocumentReplicationEvent::new(document.id.clone(), false, flags));
        self.reply(Bytes::from(json!({ "ack": document.id }).to_string()));
    }

    fn on_close(&self, reason: &CloseReason) {
        tracing::debug!("session {} closed: {}", self.session_id, reason);
        self.outbound.lock().take();
    }

    fn on_unbind(&self) {
        self.outbound.lock().take();
    }
}

/// Read a message as a document. Anything without a document ID,
/// including acknowledgements, yields `None`.
pub fn parse_document(message: &[u8]) -> Option<(Document, DocumentFlags)> {
    if let Ok(Value::Object(mut body)) = serde_json::from_slice::<Value>(message) {
        let id = match body.remove(ID_KEY) {
            Some(Value::String(id)) => id,
            _ => return None,
        };
        let flags = body
            .remove(FLAGS_KEY)
            .and_then(|v| v.as_u64())
            .and_then(|bits| u32::try_from(bits).ok())
            .map(DocumentFlags::from_bits)
            .unwrap_or(DocumentFlags::NONE);
        return Some((
            Document {
                id,
                properties: body,
            },
            flags,
        ));
    }

    let text = std::str::from_utf8(message).ok()?.trim();
    if text.is_empty() || text.starts_with('{') {
        return None;
    }
    Some((Document::new(text), DocumentFlags::NONE))
}

/// Encode a document the way [`parse_document`] reads it.
pub fn encode_document(document: &Document, flags: DocumentFlags) -> Bytes {
    let mut body = Map::new();
    body.insert(ID_KEY.to_string(), Value::String(document.id.clone()));
    if flags != DocumentFlags::NONE {
        body.insert(FLAGS_KEY.to_string(), Value::from(flags.bits()));
    }
    for (key, value) in &document.properties {
        body.insert(key.clone(), value.clone());
    }
    Bytes::from(Value::Object(body).to_string())
}
