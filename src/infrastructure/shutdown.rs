//! Shutdown Coordination
//!
//! Cancels long-running loops on request and counts the connections they
//! handed off, so callers can wait for them to drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Cancellation signal plus a live-connection counter.
///
/// Clones share state: cancelling one cancels all.
#[derive(Clone)]
pub struct ShutdownController {
    /// Name used in log lines
    label: Arc<str>,
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Connections handed off and not yet closed
    active_connections: Arc<AtomicUsize>,
    /// Wakes every task blocked in `cancelled()`
    shutdown_tx: broadcast::Sender<()>,
    /// Notified when the last connection ends after shutdown
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    pub fn new(label: impl Into<String>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            label: Arc::from(label.into()),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to the raw shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown. Returns false if it was already initiated.
    pub fn shutdown(&self) -> bool {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!("{}: shutdown initiated", self.label);
        let _ = self.shutdown_tx.send(());
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been initiated.
    ///
    /// Safe to call after the fact: the flag is checked after subscribing,
    /// so a signal sent before the call is never missed.
    pub async fn cancelled(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    fn connection_started(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_ended(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all tracked connections to end, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drain_complete.notified();
        tokio::pin!(drained);
        drained.as_mut().enable();

        if self.active_connections() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "{}: drain timeout, {} connections still active",
                    self.label,
                    self.active_connections()
                );
                false
            }
        }
    }

    /// Track a connection until the returned guard is dropped.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_started();
        ConnectionGuard {
            controller: self.clone(),
        }
    }
}

/// RAII guard for one tracked connection.
pub struct ConnectionGuard {
    controller: ShutdownController,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller.connection_ended();
    }
}

/// Resolve when the process receives Ctrl+C or SIGTERM, then shut the
/// controller down.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    controller.shutdown();
}
