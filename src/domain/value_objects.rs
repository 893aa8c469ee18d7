//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use crate::domain::entities::Document;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Unique identifier of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Unique identifier of a running listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Lifecycle state of a peer connection.
///
/// Transitions only move forward:
/// `Connecting -> Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Accepted by a local listener
    Passive,
    /// Dialed out to a remote listener
    Active,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passive => write!(f, "passive"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Why a connection ended. Delivered once to the bound message handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The remote peer disconnected or sent a close frame
    PeerInitiated,
    /// The local side asked for the close
    LocalRequested,
    /// A read, write or framing failure ended the connection
    TransportError(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerInitiated => write!(f, "peer initiated"),
            Self::LocalRequested => write!(f, "local requested"),
            Self::TransportError(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Direction of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatorType {
    /// Local to remote
    Push,
    /// Remote to local
    Pull,
    /// Both directions
    PushAndPull,
}

impl ReplicatorType {
    /// Parse a replication type name.
    ///
    /// Anything other than `"push"` or `"pull"` (including no name at all)
    /// selects push-and-pull.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|s| s.to_lowercase()).as_deref() {
            Some("push") => Self::Push,
            Some("pull") => Self::Pull,
            _ => Self::PushAndPull,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::PushAndPull => "push_and_pull",
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, Self::Push | Self::PushAndPull)
    }

    pub fn is_pull(&self) -> bool {
        matches!(self, Self::Pull | Self::PushAndPull)
    }
}

impl Default for ReplicatorType {
    fn default() -> Self {
        Self::PushAndPull
    }
}

impl std::fmt::Display for ReplicatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flags attached to a replicated document revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentFlags(u32);

impl DocumentFlags {
    pub const NONE: Self = Self(0);
    /// The revision is a deletion
    pub const DELETED: Self = Self(1);
    /// The user lost access to the document
    pub const ACCESS_REMOVED: Self = Self(2);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DocumentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Key read by the stock boolean filter.
pub const DEFAULT_BOOLEAN_FILTER_KEY: &str = "new_field_1";

/// Predicate deciding whether a document crosses the wire.
///
/// The transport never evaluates filters itself; it carries the selected
/// variant into the session configuration unchanged.
#[derive(Clone)]
pub enum ReplicationFilter {
    /// Accept every document
    AlwaysAccept,
    /// Accept unless the named property is present and false
    BooleanField(String),
    /// Reject deletions
    Deleted,
    /// Reject revisions whose access was revoked
    AccessRevoked,
    /// Caller-supplied predicate
    Custom(Arc<dyn Fn(&Document, DocumentFlags) -> bool + Send + Sync>),
}

impl ReplicationFilter {
    /// Select a stock filter by callback name.
    ///
    /// `"boolean"`, `"deleted"` and `"access_revoked"` are recognized;
    /// everything else accepts all documents.
    pub fn from_callback_name(name: Option<&str>) -> Self {
        match name {
            Some("boolean") => Self::BooleanField(DEFAULT_BOOLEAN_FILTER_KEY.to_string()),
            Some("deleted") => Self::Deleted,
            Some("access_revoked") => Self::AccessRevoked,
            _ => Self::AlwaysAccept,
        }
    }

    /// Wrap a custom predicate.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Document, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Evaluate the filter.
    pub fn accepts(&self, document: &Document, flags: DocumentFlags) -> bool {
        match self {
            Self::AlwaysAccept => true,
            Self::BooleanField(key) => {
                if document.contains(key) {
                    document.boolean(key)
                } else {
                    true
                }
            }
            Self::Deleted => flags.bits() != DocumentFlags::DELETED.bits(),
            Self::AccessRevoked => flags.bits() != DocumentFlags::ACCESS_REMOVED.bits(),
            Self::Custom(predicate) => predicate(document, flags),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AlwaysAccept => "always_accept",
            Self::BooleanField(_) => "boolean",
            Self::Deleted => "deleted",
            Self::AccessRevoked => "access_revoked",
            Self::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Debug for ReplicationFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BooleanField(key) => f.debug_tuple("BooleanField").field(key).finish(),
            other => f.write_str(other.name()),
        }
    }
}
