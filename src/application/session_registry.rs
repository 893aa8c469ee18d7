//! Session Registry
//!
//! Binds live connections to replication configurations and drives each
//! session through the injected engine. Every bound connection gets a
//! close watcher so a dropped peer tears its session down without any
//! caller involvement.

use crate::application::event_capture::EventCapture;
use crate::domain::entities::ReplicationConfig;
use crate::domain::ports::{EventSink, MessageEndpoint, MessageHandler, ReplicationEngine, SessionContext};
use crate::domain::value_objects::{CloseReason, ConnectionId, ConnectionState, SessionId};
use crate::error::RegistryError;
use crate::transport::connection::PeerConnection;
use crate::transport::listener::ConnectionAcceptor;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// Lifecycle of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Bound,
    Running,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Bound => "bound",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub state: SessionState,
    pub connection_state: ConnectionState,
    pub peer_addr: Option<SocketAddr>,
    pub database: String,
}

struct Session {
    id: SessionId,
    connection: Arc<PeerConnection>,
    config: ReplicationConfig,
    state: parking_lot::Mutex<SessionState>,
    handler: parking_lot::Mutex<Option<Arc<dyn MessageHandler>>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Serializes start, unbind and teardown.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            connection_id: self.connection.id(),
            state: self.state(),
            connection_state: self.connection.state(),
            peer_addr: self.connection.peer_addr(),
            database: self.config.database.clone(),
        }
    }
}

/// Registry of connection-to-session bindings.
pub struct SessionRegistry {
    engine: Arc<dyn ReplicationEngine>,
    events: Arc<EventCapture>,
    bindings: DashMap<ConnectionId, SessionId>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn ReplicationEngine>, events: Arc<EventCapture>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            events,
            bindings: DashMap::new(),
            sessions: DashMap::new(),
        })
    }

    pub fn events(&self) -> &Arc<EventCapture> {
        &self.events
    }

    /// Bind an open connection to a configuration.
    ///
    /// A connection carries at most one active session at a time.
    pub fn bind(
        self: &Arc<Self>,
        connection: &Arc<PeerConnection>,
        config: ReplicationConfig,
    ) -> Result<SessionId, RegistryError> {
        if !connection.is_open() {
            return Err(RegistryError::ConnectionClosed(connection.id().to_string()));
        }

        let session_id = SessionId::new();
        match self.bindings.entry(connection.id()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::AlreadyBound(connection.id().to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(session_id);
            }
        }

        let session = Arc::new(Session {
            id: session_id,
            connection: connection.clone(),
            config,
            state: parking_lot::Mutex::new(SessionState::Bound),
            handler: parking_lot::Mutex::new(None),
            watcher: parking_lot::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        });
        self.sessions.insert(session_id, session.clone());
        self.events.open(session_id);

        let watcher = self.spawn_close_watcher(session_id, connection);
        *session.watcher.lock() = Some(watcher);

        tracing::info!(
            "bound connection {} to session {} (database {}, {})",
            connection.id(),
            session_id,
            session.config.database,
            session.config.replicator_type
        );
        Ok(session_id)
    }

    fn spawn_close_watcher(
        self: &Arc<Self>,
        session_id: SessionId,
        connection: &PeerConnection,
    ) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let mut state_rx = connection.subscribe_state();
        tokio::spawn(async move {
            let _ = state_rx
                .wait_for(|state| *state == ConnectionState::Closed)
                .await;
            if let Some(registry) = registry.upgrade() {
                registry.teardown(session_id).await;
            }
        })
    }

    /// Open replication for a bound session.
    ///
    /// Starting a running session is a no-op. On engine failure the session
    /// stays bound.
    pub async fn start(&self, session_id: SessionId) -> Result<(), RegistryError> {
        let session = self.session(session_id)?;
        let _lifecycle = session.lifecycle.lock().await;

        match session.state() {
            SessionState::Running => return Ok(()),
            SessionState::Stopped => {
                return Err(RegistryError::SessionStopped(session_id.to_string()))
            }
            SessionState::Bound => {}
        }
        if !session.connection.is_open() {
            return Err(RegistryError::ConnectionClosed(
                session.connection.id().to_string(),
            ));
        }

        let endpoint: Arc<dyn MessageEndpoint> = session.connection.clone();
        let events: Arc<dyn EventSink> = self.events.open(session_id);
        let context = SessionContext {
            session_id,
            role: session.connection.role(),
            config: session.config.clone(),
            endpoint,
            events,
        };

        let handler = match self.engine.start_replication(context).await {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!("engine refused session {}: {}", session_id, e);
                return Err(e.into());
            }
        };

        if session.connection.set_handler(handler.clone()).is_err() {
            let reason = session
                .connection
                .close_reason()
                .unwrap_or(CloseReason::PeerInitiated);
            handler.on_close(&reason);
            return Err(RegistryError::ConnectionClosed(
                session.connection.id().to_string(),
            ));
        }

        *session.handler.lock() = Some(handler);
        session.set_state(SessionState::Running);
        tracing::info!("session {} running", session_id);
        Ok(())
    }

    /// Stop a session and release its connection binding.
    ///
    /// The connection stays open and the event log is kept.
    pub async fn unbind(&self, session_id: SessionId) -> Result<(), RegistryError> {
        let session = self.session(session_id)?;
        let _lifecycle = session.lifecycle.lock().await;
        if self.stop_session(&session, true) {
            tracing::info!(
                "unbound session {} from connection {}",
                session_id,
                session.connection.id()
            );
        }
        Ok(())
    }

    /// Unbind if needed, then forget the session and its event log.
    pub async fn discard(&self, session_id: SessionId) -> Result<(), RegistryError> {
        let session = self.session(session_id)?;
        let _lifecycle = session.lifecycle.lock().await;
        self.stop_session(&session, true);
        self.sessions.remove(&session_id);
        self.events.discard(session_id);
        tracing::info!("discarded session {}", session_id);
        Ok(())
    }

    /// Discard every stopped session. Returns how many were removed.
    ///
    /// Stopped sessions otherwise stay registered so their event logs can
    /// still be read.
    pub async fn discard_stopped(&self) -> usize {
        let stopped: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Stopped)
            .map(|entry| *entry.key())
            .collect();

        let mut discarded = 0;
        for session_id in stopped {
            if self.discard(session_id).await.is_ok() {
                discarded += 1;
            }
        }
        discarded
    }

    /// Close a session's connection and tear the session down.
    pub async fn close_session(&self, session_id: SessionId) -> Result<(), RegistryError> {
        let session = self.session(session_id)?;
        session.connection.close(CloseReason::LocalRequested).await;
        let _lifecycle = session.lifecycle.lock().await;
        self.stop_session(&session, false);
        Ok(())
    }

    /// Close every connection with an active session. Returns how many
    /// sessions were closed.
    pub async fn close_all(&self) -> usize {
        let active: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state() != SessionState::Stopped)
            .map(|entry| *entry.key())
            .collect();

        let mut closed = 0;
        for session_id in active {
            if self.close_session(session_id).await.is_ok() {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!("closed {} replication sessions", closed);
        }
        closed
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() != SessionState::Stopped)
            .count()
    }

    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.sessions.get(&session_id).map(|s| s.state())
    }

    pub fn session_info(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(&session_id).map(|s| s.info())
    }

    /// Session currently bound to a connection.
    pub fn session_for(&self, connection_id: ConnectionId) -> Option<SessionId> {
        self.bindings.get(&connection_id).map(|entry| *entry.value())
    }

    pub fn connection(&self, session_id: SessionId) -> Option<Arc<PeerConnection>> {
        self.sessions.get(&session_id).map(|s| s.connection.clone())
    }

    fn session(&self, session_id: SessionId) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))
    }

    /// Run by the close watcher once the connection is closed.
    async fn teardown(&self, session_id: SessionId) {
        let session = match self.session(session_id) {
            Ok(session) => session,
            Err(_) => return,
        };
        let _lifecycle = session.lifecycle.lock().await;
        if self.stop_session(&session, false) {
            let reason = session
                .connection
                .close_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            tracing::info!(
                "session {} torn down: connection {} closed ({})",
                session_id,
                session.connection.id(),
                reason
            );
        }
    }

    /// Move a session to `Stopped`. Caller holds the lifecycle lock.
    ///
    /// Returns false if it was already stopped.
    fn stop_session(&self, session: &Session, abort_watcher: bool) -> bool {
        if session.state() == SessionState::Stopped {
            return false;
        }

        let handler = session.handler.lock().take();
        if let Some(handler) = handler {
            // None here means the connection already delivered on_close.
            if session.connection.clear_handler().is_some() {
                handler.on_unbind();
            }
        }

        self.bindings
            .remove_if(&session.connection.id(), |_, bound| *bound == session.id);
        session.set_state(SessionState::Stopped);

        let watcher = session.watcher.lock().take();
        if abort_watcher {
            if let Some(watcher) = watcher {
                watcher.abort();
            }
        }
        true
    }
}

/// Binds every connection a listener accepts and starts its session.
pub struct RegistryAcceptor {
    registry: Arc<SessionRegistry>,
    config: ReplicationConfig,
    single_connection: bool,
    sessions: parking_lot::Mutex<Vec<SessionId>>,
    serial: tokio::sync::Mutex<()>,
}

impl RegistryAcceptor {
    pub fn new(registry: Arc<SessionRegistry>, config: ReplicationConfig) -> Self {
        Self {
            registry,
            config,
            single_connection: false,
            sessions: parking_lot::Mutex::new(Vec::new()),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the previous connection whenever a new one is accepted.
    pub fn single_connection(mut self, enabled: bool) -> Self {
        self.single_connection = enabled;
        self
    }

    /// Sessions created by this acceptor that are still registered,
    /// oldest first.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|id| self.registry.session_state(*id).is_some());
        sessions.clone()
    }

    pub fn latest_session(&self) -> Option<SessionId> {
        self.sessions.lock().last().copied()
    }
}

#[async_trait]
impl ConnectionAcceptor for RegistryAcceptor {
    async fn accept(&self, connection: Arc<PeerConnection>) {
        let _serial = if self.single_connection {
            let guard = self.serial.lock().await;
            if let Some(previous) = self.latest_session() {
                tracing::info!("replacing session {} with connection {}", previous, connection.id());
                if let Err(e) = self.registry.close_session(previous).await {
                    tracing::debug!("previous session {} already gone: {}", previous, e);
                }
            }
            Some(guard)
        } else {
            None
        };

        let session_id = match self.registry.bind(&connection, self.config.clone()) {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::warn!("failed to bind connection {}: {}", connection.id(), e);
                connection.close(CloseReason::LocalRequested).await;
                return;
            }
        };
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|id| self.registry.session_state(*id).is_some());
            sessions.push(session_id);
        }

        if let Err(e) = self.registry.start(session_id).await {
            tracing::error!("failed to start session {}: {}", session_id, e);
            if let Err(e) = self.registry.close_session(session_id).await {
                tracing::debug!("session {} already gone: {}", session_id, e);
            }
        }
    }
}
