//! Replicator TCP Listener
//!
//! Binds a port and hands every accepted socket, wrapped in a
//! [`PeerConnection`], to a [`ConnectionAcceptor`]. Each hand-off runs on
//! its own task, so a slow acceptor or a stalled peer never holds up the
//! accept loop.

use crate::domain::value_objects::{ConnectionState, ListenerId};
use crate::error::ListenerError;
use crate::infrastructure::ShutdownController;
use crate::transport::config::TransportConfig;
use crate::transport::connection::PeerConnection;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receives connections accepted by a listener.
///
/// Ownership of the connection moves to the acceptor; the listener keeps
/// no reference to it.
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    async fn accept(&self, connection: Arc<PeerConnection>);
}

/// Source of inbound sockets for the accept loop.
#[async_trait]
pub(crate) trait Incoming: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Incoming for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Lifecycle of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Listening,
    Stopped,
}

struct Running {
    local_addr: SocketAddr,
    controller: ShutdownController,
    task: JoinHandle<()>,
}

/// TCP listener feeding accepted peers to the session registry.
pub struct ReplicatorTcpListener {
    id: ListenerId,
    config: TransportConfig,
    state_tx: Arc<watch::Sender<ListenerState>>,
    fatal: Arc<parking_lot::Mutex<Option<ListenerError>>>,
    running: tokio::sync::Mutex<Option<Running>>,
    last_controller: parking_lot::Mutex<Option<ShutdownController>>,
}

impl ReplicatorTcpListener {
    pub fn new(config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ListenerState::Unbound);
        Self {
            id: ListenerId::new(),
            config,
            state_tx: Arc::new(state_tx),
            fatal: Arc::new(parking_lot::Mutex::new(None)),
            running: tokio::sync::Mutex::new(None),
            last_controller: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Address actually bound, while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind the configured port and start accepting.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(
        &self,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Result<SocketAddr, ListenerError> {
        let mut running = self.running.lock().await;
        ensure_idle(&running)?;

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        *running = Some(self.launch(listener, local_addr, acceptor));
        Ok(local_addr)
    }

    /// Run the accept loop over an arbitrary socket source.
    #[cfg(test)]
    pub(crate) async fn start_with<I: Incoming>(
        &self,
        incoming: I,
        local_addr: SocketAddr,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Result<SocketAddr, ListenerError> {
        let mut running = self.running.lock().await;
        ensure_idle(&running)?;
        *running = Some(self.launch(incoming, local_addr, acceptor));
        Ok(local_addr)
    }

    fn launch<I: Incoming>(
        &self,
        incoming: I,
        local_addr: SocketAddr,
        acceptor: Arc<dyn ConnectionAcceptor>,
    ) -> Running {
        let controller = ShutdownController::new(format!("listener {}", local_addr));
        *self.last_controller.lock() = Some(controller.clone());
        *self.fatal.lock() = None;
        self.state_tx.send_replace(ListenerState::Listening);

        tracing::info!("replication listener {} listening on {}", self.id, local_addr);

        let task = tokio::spawn(accept_loop(
            incoming,
            local_addr,
            acceptor,
            self.config.clone(),
            controller.clone(),
            self.state_tx.clone(),
            self.fatal.clone(),
        ));

        Running {
            local_addr,
            controller,
            task,
        }
    }

    /// Stop accepting and release the port.
    ///
    /// Cancels a pending accept immediately. Connections already handed off
    /// stay open. Returns false if no accept loop was running.
    pub async fn stop(&self) -> bool {
        let running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return false,
        };

        let was_running = !running.task.is_finished();
        running.controller.shutdown();
        if let Err(e) = running.task.await {
            tracing::error!("accept loop for {} ended abnormally: {:?}", running.local_addr, e);
        }
        self.state_tx.send_replace(ListenerState::Stopped);

        if was_running {
            tracing::info!("replication listener {} stopped", self.id);
        }
        was_running
    }

    /// Resolve once the accept loop has ended, by stop or by failure.
    pub async fn stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ListenerState::Stopped).await;
    }

    /// Wait for the accept loop to end and report why.
    ///
    /// `Ok` after a requested stop, the fatal accept error otherwise.
    pub async fn wait(&self) -> Result<(), ListenerError> {
        self.stopped().await;
        match self.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Take the error that terminated the accept loop, if any.
    pub fn take_error(&self) -> Option<ListenerError> {
        self.fatal.lock().take()
    }

    /// Connections accepted by the most recent run that are still open.
    pub fn active_connections(&self) -> usize {
        self.last_controller
            .lock()
            .as_ref()
            .map(|c| c.active_connections())
            .unwrap_or(0)
    }

    /// After `stop`, wait for accepted connections to close.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let controller = self.last_controller.lock().clone();
        match controller {
            Some(controller) => controller.wait_for_drain(timeout).await,
            None => true,
        }
    }
}

impl Drop for ReplicatorTcpListener {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.controller.shutdown();
            }
        }
    }
}

fn ensure_idle(running: &Option<Running>) -> Result<(), ListenerError> {
    match running {
        Some(current) if !current.task.is_finished() => Err(ListenerError::AlreadyStarted),
        _ => Ok(()),
    }
}

async fn accept_loop<I: Incoming>(
    incoming: I,
    local_addr: SocketAddr,
    acceptor: Arc<dyn ConnectionAcceptor>,
    config: TransportConfig,
    controller: ShutdownController,
    state_tx: Arc<watch::Sender<ListenerState>>,
    fatal: Arc<parking_lot::Mutex<Option<ListenerError>>>,
) {
    let result = loop {
        tokio::select! {
            _ = controller.cancelled() => break Ok(()),
            accepted = incoming.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!("accepted peer {} on {}", addr, local_addr);
                    let connection = PeerConnection::open(stream, &config);
                    let mut state_rx = connection.subscribe_state();
                    let guard = controller.connection_guard();
                    let acceptor = acceptor.clone();

                    tokio::spawn(async move {
                        acceptor.accept(connection).await;
                        let _ = state_rx
                            .wait_for(|state| *state == ConnectionState::Closed)
                            .await;
                        drop(guard);
                    });
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("transient accept error on {}: {:?}", local_addr, e);
                    tokio::select! {
                        _ = controller.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(config.accept_backoff) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("accept failed on {}: {:?}", local_addr, e);
                    break Err(ListenerError::Accept {
                        addr: local_addr,
                        source: e,
                    });
                }
            }
        }
    };

    drop(incoming);
    if let Err(e) = result {
        *fatal.lock() = Some(e);
    }
    state_tx.send_replace(ListenerState::Stopped);
}

/// Accept errors worth retrying.
fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => is_descriptor_exhaustion(e),
    }
}

#[cfg(unix)]
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    // ENFILE, EMFILE
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_e: &io::Error) -> bool {
    false
}

/// Replays a fixed list of accept errors, then waits forever.
#[cfg(test)]
pub(crate) struct ScriptedIncoming {
    errors: parking_lot::Mutex<std::collections::VecDeque<io::ErrorKind>>,
}

#[cfg(test)]
impl ScriptedIncoming {
    pub(crate) fn new(errors: Vec<io::ErrorKind>) -> Self {
        Self {
            errors: parking_lot::Mutex::new(errors.into()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Incoming for ScriptedIncoming {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let next = self.errors.lock().pop_front();
        match next {
            Some(kind) => Err(io::Error::from(kind)),
            None => std::future::pending().await,
        }
    }
}
