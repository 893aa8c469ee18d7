//! Peer-to-Peer Service - caller-facing control surface
//!
//! Owns the listeners and the session registry and exposes the operations
//! a test harness drives: listen, connect, bind, start and stop sessions,
//! and read back the replication events each session produced.

use crate::application::session_registry::{RegistryAcceptor, SessionInfo, SessionRegistry};
use crate::application::event_capture::EventCapture;
use crate::domain::entities::{DocumentReplicationEvent, ReplicationConfig, ReplicationTarget};
use crate::domain::ports::ReplicationEngine;
use crate::domain::value_objects::{CloseReason, ListenerId, SessionId};
use crate::error::{ListenerError, RegistryError, TransportError};
use crate::transport::config::TransportConfig;
use crate::transport::connection::PeerConnection;
use crate::transport::connector;
use crate::transport::listener::{ConnectionAcceptor, ListenerState, ReplicatorTcpListener};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct ListenerEntry {
    listener: Arc<ReplicatorTcpListener>,
    acceptor: Arc<RegistryAcceptor>,
}

/// Replication transport service.
///
/// Passive sessions come from listeners; active sessions from
/// [`PeerToPeerService::replicate`]. Both land in the same registry.
pub struct PeerToPeerService {
    transport: TransportConfig,
    registry: Arc<SessionRegistry>,
    listeners: DashMap<ListenerId, ListenerEntry>,
}

impl PeerToPeerService {
    pub fn new(engine: Arc<dyn ReplicationEngine>, transport: TransportConfig) -> Self {
        Self {
            transport,
            registry: SessionRegistry::new(engine, Arc::new(EventCapture::new())),
            listeners: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    // ===== Listeners =====

    /// Listen on `port` and serve every accepted peer with `config`.
    ///
    /// Port 0 picks an ephemeral port; the bound address is returned.
    ///
    /// Every session the listener creates stays registered, together with
    /// its event log, after its peer disconnects. Long-running listeners
    /// should call [`PeerToPeerService::discard_stopped_sessions`] once the
    /// logs have been read.
    pub async fn start_listener(
        &self,
        port: u16,
        config: ReplicationConfig,
    ) -> Result<(ListenerId, SocketAddr), ListenerError> {
        let transport = self.transport.clone().port(port);
        let acceptor = Arc::new(
            RegistryAcceptor::new(self.registry.clone(), config)
                .single_connection(transport.single_connection),
        );
        let listener = Arc::new(ReplicatorTcpListener::new(transport));

        let dyn_acceptor: Arc<dyn ConnectionAcceptor> = acceptor.clone();
        let addr = listener.start(dyn_acceptor).await?;
        let id = listener.id();
        self.listeners.insert(id, ListenerEntry { listener, acceptor });
        Ok((id, addr))
    }

    /// Stop and forget a listener. Sessions it produced keep running.
    ///
    /// Returns false for an unknown or already stopped listener.
    pub async fn stop_listener(&self, id: ListenerId) -> bool {
        let entry = match self.listeners.remove(&id) {
            Some((_, entry)) => entry,
            None => return false,
        };
        entry.listener.stop().await
    }

    /// Wait for a listener's accept loop to end on its own and report why.
    ///
    /// A loop that died on a hard accept error yields that error. The
    /// listener is forgotten either way. Returns `Ok` at once for an
    /// unknown listener.
    pub async fn wait_listener(&self, id: ListenerId) -> Result<(), ListenerError> {
        let listener = match self.listeners.get(&id) {
            Some(entry) => entry.listener.clone(),
            None => return Ok(()),
        };
        let result = listener.wait().await;
        self.listeners.remove(&id);
        result
    }

    /// Error that ended a listener's accept loop, if it has failed.
    ///
    /// A failed listener is forgotten once its error is taken. Returns
    /// `None` while it is still listening.
    pub fn listener_error(&self, id: ListenerId) -> Option<ListenerError> {
        let failed = self
            .listeners
            .get(&id)
            .map(|entry| entry.listener.state() == ListenerState::Stopped)?;
        if !failed {
            return None;
        }
        let (_, entry) = self.listeners.remove(&id)?;
        entry.listener.take_error()
    }

    pub fn listeners(&self) -> Vec<ListenerId> {
        self.listeners.iter().map(|entry| *entry.key()).collect()
    }

    pub async fn listener_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        let listener = self.listeners.get(&id).map(|e| e.listener.clone())?;
        listener.local_addr().await
    }

    /// Sessions created by a listener, oldest first.
    pub fn listener_sessions(&self, id: ListenerId) -> Vec<SessionId> {
        self.listeners
            .get(&id)
            .map(|entry| entry.acceptor.sessions())
            .unwrap_or_default()
    }

    // ===== Active side =====

    /// Dial a remote peer. The connection is not bound yet.
    pub async fn connect(
        &self,
        target: &ReplicationTarget,
    ) -> Result<Arc<PeerConnection>, TransportError> {
        connector::connect_target(target, &self.transport).await
    }

    /// Dial a remote peer, bind the connection and start replicating.
    pub async fn replicate(
        &self,
        target: &ReplicationTarget,
        config: ReplicationConfig,
    ) -> Result<SessionId, RegistryError> {
        let connection = self.connect(target).await?;
        let session_id = match self.registry.bind(&connection, config) {
            Ok(session_id) => session_id,
            Err(e) => {
                connection.close(CloseReason::LocalRequested).await;
                return Err(e);
            }
        };

        if let Err(e) = self.registry.start(session_id).await {
            if let Err(close_err) = self.registry.close_session(session_id).await {
                tracing::debug!("session {} already gone: {}", session_id, close_err);
            }
            return Err(e);
        }
        Ok(session_id)
    }

    // ===== Sessions =====

    pub fn bind(
        &self,
        connection: &Arc<PeerConnection>,
        config: ReplicationConfig,
    ) -> Result<SessionId, RegistryError> {
        self.registry.bind(connection, config)
    }

    pub async fn start_session(&self, session_id: SessionId) -> Result<(), RegistryError> {
        self.registry.start(session_id).await
    }

    /// Stop replicating; the connection and event log are kept.
    pub async fn stop_session(&self, session_id: SessionId) -> Result<(), RegistryError> {
        self.registry.unbind(session_id).await
    }

    pub async fn discard_session(&self, session_id: SessionId) -> Result<(), RegistryError> {
        self.registry.discard(session_id).await
    }

    pub fn session_info(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.registry.session_info(session_id)
    }

    /// Forget every stopped session and its event log.
    pub async fn discard_stopped_sessions(&self) -> usize {
        self.registry.discard_stopped().await
    }

    // ===== Events =====

    pub fn event_count(&self, session_id: SessionId) -> usize {
        self.registry.events().count(session_id)
    }

    pub fn events(&self, session_id: SessionId) -> Vec<DocumentReplicationEvent> {
        self.registry.events().drain(session_id)
    }

    pub fn stop_capture(&self, session_id: SessionId) -> bool {
        self.registry.events().stop_capture(session_id)
    }

    // ===== Shutdown =====

    /// Stop every listener, close every session and wait for accepted
    /// connections to drain. Returns false if the drain timed out.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let ids = self.listeners();
        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.listeners.remove(&id) {
                entry.listener.stop().await;
                stopped.push(entry.listener);
            }
        }

        self.registry.close_all().await;

        let mut drained = true;
        for listener in stopped {
            if !listener.wait_for_drain(drain_timeout).await {
                tracing::warn!(
                    "listener {} still has {} connections after {:?}",
                    listener.id(),
                    listener.active_connections(),
                    drain_timeout
                );
                drained = false;
            }
        }
        drained
    }
}
