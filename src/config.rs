use crate::domain::entities::ReplicationConfig;
use crate::domain::value_objects::ReplicatorType;
use crate::transport::config::{TransportConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Listener settings
    pub listen_host: String,
    pub listen_port: u16,
    pub max_frame_size: usize,
    pub accept_backoff_ms: u64,
    pub close_flush_timeout_ms: u64,
    pub single_connection: bool,
    pub drain_timeout_secs: u64,

    // Replication settings for accepted peers
    pub database: String,
    pub replication_type: Option<String>,
    pub continuous: bool,
    pub document_ids: Option<Vec<String>>,
    pub pull_filter: bool,
    pub push_filter: bool,
    pub filter_callback: Option<String>,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: DEFAULT_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_backoff_ms: 100,
            close_flush_timeout_ms: 1000,
            single_connection: false,
            drain_timeout_secs: 5,
            database: "db".to_string(),
            replication_type: None,
            continuous: false,
            document_ids: None,
            pull_filter: false,
            push_filter: false,
            filter_callback: None,
            debug: false,
        }
    }
}

impl Config {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig::default()
            .host(self.listen_host.clone())
            .port(self.listen_port)
            .max_frame_size(self.max_frame_size)
            .accept_backoff(Duration::from_millis(self.accept_backoff_ms))
            .close_flush_timeout(Duration::from_millis(self.close_flush_timeout_ms))
            .single_connection(self.single_connection)
    }

    pub fn replication(&self) -> ReplicationConfig {
        let mut config = ReplicationConfig::new(self.database.clone())
            .replicator_type(ReplicatorType::from_name(self.replication_type.as_deref()))
            .continuous(self.continuous)
            .stock_filters(
                self.pull_filter,
                self.push_filter,
                self.filter_callback.as_deref(),
            );
        if let Some(ids) = &self.document_ids {
            config = config.document_ids(ids.clone());
        }
        config
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

pub fn load_config() -> anyhow::Result<Config> {
    let listen_host = std::env::var("P2P_LISTEN_HOST")
        .unwrap_or_else(|_| "0.0.0.0".to_string());

    let listen_port = std::env::var("P2P_LISTEN_PORT")
        .unwrap_or_else(|_| DEFAULT_PORT.to_string())
        .parse()
        .unwrap_or(DEFAULT_PORT);

    let max_frame_size = std::env::var("P2P_MAX_FRAME_SIZE")
        .unwrap_or_else(|_| DEFAULT_MAX_FRAME_SIZE.to_string())
        .parse()
        .unwrap_or(DEFAULT_MAX_FRAME_SIZE);

    let accept_backoff_ms = std::env::var("P2P_ACCEPT_BACKOFF_MS")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);

    let close_flush_timeout_ms = std::env::var("P2P_CLOSE_FLUSH_TIMEOUT_MS")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()
        .unwrap_or(1000);

    let single_connection = env_flag("P2P_SINGLE_CONNECTION");

    let drain_timeout_secs = std::env::var("P2P_DRAIN_TIMEOUT_SECS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);

    let database = std::env::var("P2P_DATABASE")
        .unwrap_or_else(|_| "db".to_string());

    let replication_type = std::env::var("P2P_REPLICATION_TYPE").ok();
    let continuous = env_flag("P2P_CONTINUOUS");

    let document_ids = std::env::var("P2P_DOCUMENT_IDS")
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

    let pull_filter = env_flag("P2P_PULL_FILTER");
    let push_filter = env_flag("P2P_PUSH_FILTER");
    let filter_callback = std::env::var("P2P_FILTER_CALLBACK").ok();

    let debug = std::env::var("DEBUG").is_ok();

    let config = Config {
        listen_host,
        listen_port,
        max_frame_size,
        accept_backoff_ms,
        close_flush_timeout_ms,
        single_connection,
        drain_timeout_secs,
        database,
        replication_type,
        continuous,
        document_ids,
        pull_filter,
        push_filter,
        filter_callback,
        debug,
    };
    config.transport().validate()?;
    Ok(config)
}
