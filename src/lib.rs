//! p2p-bridge Library
//!
//! Peer-to-peer replication transport for test harnesses: framed TCP
//! connections, a listener, session binding to an injected replication
//! engine, and per-session event capture.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod transport;

// Re-export commonly used types
pub use adapters::outbound::EchoEngine;
pub use application::{EventCapture, PeerToPeerService, SessionRegistry, SessionState};
pub use config::load_config;
pub use domain::entities::{Document, DocumentReplicationEvent, ReplicationConfig, ReplicationTarget};
pub use domain::ports::{EventSink, MessageEndpoint, MessageHandler, ReplicationEngine, SessionContext};
pub use domain::value_objects::{
    CloseReason, ConnectionId, ConnectionState, DocumentFlags, ListenerId, PeerRole,
    ReplicationFilter, ReplicatorType, SessionId,
};
pub use error::{EngineError, FramingError, ListenerError, RegistryError, TransportError};
pub use transport::{PeerConnection, ReplicatorTcpListener, TransportConfig};
