//! Domain Layer
//!
//! Replication vocabulary and the ports the transport and the engine
//! meet at. Nothing here performs I/O.

pub mod entities;
pub mod ports;
pub mod value_objects;

pub use entities::{
    Document, DocumentReplicationEvent, ReplicationConfig, ReplicationErrorInfo, ReplicationTarget,
};
pub use value_objects::{
    CloseReason, ConnectionId, ConnectionState, DocumentFlags, ListenerId, PeerRole,
    ReplicationFilter, ReplicatorType, SessionId,
};
