//! Active-side connector: dials a remote listener and wraps the socket.

use crate::domain::entities::ReplicationTarget;
use crate::domain::value_objects::{CloseReason, PeerRole};
use crate::error::TransportError;
use crate::transport::config::TransportConfig;
use crate::transport::connection::PeerConnection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Open an outbound connection to `host:port`.
///
/// The connection is `Connecting` until the TCP handshake completes.
pub async fn connect(
    host: &str,
    port: u16,
    config: &TransportConfig,
) -> Result<Arc<PeerConnection>, TransportError> {
    let addr = resolve(host, port).await?;
    let connection = PeerConnection::connecting(PeerRole::Active, Some(addr), config);
    tracing::debug!("connection {} dialing {}", connection.id(), addr);

    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("failed to connect to {}: {:?}", addr, e);
            connection
                .close(CloseReason::TransportError(e.to_string()))
                .await;
            return Err(TransportError::Io(e));
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("failed to set TCP_NODELAY: {:?}", e);
    }

    connection.attach(stream);
    Ok(connection)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().ok_or_else(|| {
        TransportError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}:{}", host, port),
        ))
    })
}

/// Open an outbound connection to a replication target.
pub async fn connect_target(
    target: &ReplicationTarget,
    config: &TransportConfig,
) -> Result<Arc<PeerConnection>, TransportError> {
    tracing::info!("connecting to replication target {}", target.url());
    connect(&target.host, target.port, config).await
}
