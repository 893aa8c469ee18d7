//! Domain Entities - Core replication objects
//!
//! These entities describe what a replication session replicates and
//! what it reports back. They carry no I/O.

use crate::domain::value_objects::{DocumentFlags, ReplicationFilter, ReplicatorType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document as seen by replication filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier
    pub id: String,
    /// Document body
    pub properties: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: Map::new(),
        }
    }

    /// Add a property (builder style).
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Read a property as a boolean.
    ///
    /// `true` only for a literal `true` or a non-zero number.
    pub fn boolean(&self, key: &str) -> bool {
        match self.properties.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            _ => false,
        }
    }
}

/// Configuration of one replication session.
///
/// Filters are installed only for the directions the caller asked for;
/// `None` means no filtering in that direction.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Local database name
    pub database: String,
    /// Replication direction (default: push and pull)
    pub replicator_type: ReplicatorType,
    /// Keep replicating after the first pass (default: false)
    pub continuous: bool,
    /// Restrict replication to these document IDs
    pub document_ids: Option<Vec<String>>,
    /// Filter applied to incoming documents
    pub pull_filter: Option<ReplicationFilter>,
    /// Filter applied to outgoing documents
    pub push_filter: Option<ReplicationFilter>,
}

impl ReplicationConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            replicator_type: ReplicatorType::default(),
            continuous: false,
            document_ids: None,
            pull_filter: None,
            push_filter: None,
        }
    }

    pub fn replicator_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn document_ids(mut self, ids: Vec<String>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    pub fn pull_filter(mut self, filter: ReplicationFilter) -> Self {
        self.pull_filter = Some(filter);
        self
    }

    pub fn push_filter(mut self, filter: ReplicationFilter) -> Self {
        self.push_filter = Some(filter);
        self
    }

    /// Install stock filters the way test requests describe them: a flag
    /// per direction plus one shared callback name.
    pub fn stock_filters(mut self, pull: bool, push: bool, callback: Option<&str>) -> Self {
        if pull {
            self.pull_filter = Some(ReplicationFilter::from_callback_name(callback));
        }
        if push {
            self.push_filter = Some(ReplicationFilter::from_callback_name(callback));
        }
        self
    }

    /// Check a document ID against the allowlist.
    pub fn allows_document(&self, id: &str) -> bool {
        match &self.document_ids {
            Some(ids) => ids.iter().any(|allowed| allowed == id),
            None => true,
        }
    }

    /// Whether a local document should be pushed to the peer.
    pub fn should_push(&self, document: &Document, flags: DocumentFlags) -> bool {
        self.replicator_type.is_push()
            && self.allows_document(&document.id)
            && self
                .push_filter
                .as_ref()
                .map_or(true, |f| f.accepts(document, flags))
    }

    /// Whether a remote document should be accepted locally.
    pub fn should_pull(&self, document: &Document, flags: DocumentFlags) -> bool {
        self.replicator_type.is_pull()
            && self.allows_document(&document.id)
            && self
                .pull_filter
                .as_ref()
                .map_or(true, |f| f.accepts(document, flags))
    }
}

/// Remote peer addressed by an active replicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub host: String,
    pub port: u16,
    /// Database name on the remote peer
    pub database: String,
}

impl ReplicationTarget {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
        }
    }

    /// Endpoint URL, also used as the endpoint UID.
    pub fn url(&self) -> String {
        format!("ws://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Socket address string for TCP connect.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Error attached to a replicated document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationErrorInfo {
    pub code: i32,
    pub domain: String,
}

/// One document-level replication outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReplicationEvent {
    pub doc_id: String,
    /// `true` for pushed documents, `false` for pulled ones
    pub is_push: bool,
    pub error: Option<ReplicationErrorInfo>,
    pub flags: DocumentFlags,
}

impl DocumentReplicationEvent {
    pub fn new(doc_id: impl Into<String>, is_push: bool, flags: DocumentFlags) -> Self {
        Self {
            doc_id: doc_id.into(),
            is_push,
            error: None,
            flags,
        }
    }

    pub fn with_error(mut self, code: i32, domain: impl Into<String>) -> Self {
        self.error = Some(ReplicationErrorInfo {
            code,
            domain: domain.into(),
        });
        self
    }
}

impl std::fmt::Display for DocumentReplicationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (code, domain) = match &self.error {
            Some(e) => (e.code.to_string(), e.domain.clone()),
            None => ("nil".to_string(), "nil".to_string()),
        };
        write!(
            f,
            "doc_id: {}, error_code: {}, error_domain: {}, push: {}, flags: {}",
            self.doc_id,
            code,
            domain,
            self.is_push,
            self.flags.bits()
        )
    }
}
