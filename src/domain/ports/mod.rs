mod message_endpoint;
mod replication_engine;

pub use message_endpoint::{MessageEndpoint, MessageHandler};
pub use replication_engine::{EventSink, ReplicationEngine, SessionContext};
