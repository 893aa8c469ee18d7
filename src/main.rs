//! p2p-bridge - replication transport test server
//!
//! Composition root: listens for peers and serves each one with the
//! loopback engine until Ctrl+C or SIGTERM, or until the listener fails.

use p2p_bridge::adapters::outbound::EchoEngine;
use p2p_bridge::application::PeerToPeerService;
use p2p_bridge::config::load_config;
use p2p_bridge::infrastructure::{shutdown_signal, ShutdownController};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting p2p-bridge listen={}:{} database={}",
        cfg.listen_host,
        cfg.listen_port,
        cfg.database
    );

    // ===== COMPOSITION ROOT =====

    let engine = Arc::new(EchoEngine::new());
    let service = PeerToPeerService::new(engine, cfg.transport());

    let (listener_id, addr) = service
        .start_listener(cfg.listen_port, cfg.replication())
        .await?;
    tracing::info!("listener {} accepting peers on {}", listener_id, addr);

    let shutdown = ShutdownController::new("process");
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let failure = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = service.wait_listener(listener_id) => result.err(),
    };

    if !service.shutdown(cfg.drain_timeout()).await {
        tracing::warn!("shutdown finished with connections still open");
    }

    if let Some(e) = failure {
        tracing::error!("listener {} failed: {}", listener_id, e);
        return Err(e.into());
    }
    tracing::info!("p2p-bridge stopped");
    Ok(())
}
