//! Transport Layer
//!
//! TCP framing, connections and the listener that feeds them to the
//! session registry.

pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod listener;

pub use codec::{encode_frame, Frame, FrameDecoder, FrameKind, FRAME_HEADER_SIZE};
pub use config::{ConfigError, TransportConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};
pub use connection::PeerConnection;
pub use connector::{connect, connect_target};
pub use listener::{ConnectionAcceptor, ListenerState, ReplicatorTcpListener};
