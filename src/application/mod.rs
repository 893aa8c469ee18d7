//! Application Layer
//!
//! Session binding, event capture and the service that drives them.

pub mod event_capture;
pub mod peer_service;
pub mod session_registry;

pub use event_capture::{EventCapture, SessionEventSink};
pub use peer_service::PeerToPeerService;
pub use session_registry::{RegistryAcceptor, SessionInfo, SessionRegistry, SessionState};
