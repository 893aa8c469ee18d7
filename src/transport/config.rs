//! Transport Configuration
//!
//! Tunables for the listener, connections and frame codec.

use std::time::Duration;

/// Default port for peer-to-peer test scenarios.
pub const DEFAULT_PORT: u16 = 5000;

/// Default upper bound on a single frame payload (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Configuration for the peer-to-peer transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Host to bind the listener on (default: 0.0.0.0)
    pub host: String,

    /// Port to bind the listener on (default: 5000)
    pub port: u16,

    /// Largest accepted frame payload in bytes (default: 10 MiB)
    pub max_frame_size: usize,

    /// Initial capacity of the per-connection read buffer (default: 8 KiB)
    pub read_buffer_size: usize,

    /// Pause after a transient accept error (default: 100ms)
    pub accept_backoff: Duration,

    /// Upper bound on flushing pending writes during close (default: 1s)
    pub close_flush_timeout: Duration,

    /// Replace the previous connection when a new one is accepted (default: false)
    pub single_connection: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 8 * 1024,
            accept_backoff: Duration::from_millis(100),
            close_flush_timeout: Duration::from_secs(1),
            single_connection: false,
        }
    }
}

impl TransportConfig {
    /// Set the bind host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the maximum frame payload size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the accept backoff.
    pub fn accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }

    /// Set the close flush timeout.
    pub fn close_flush_timeout(mut self, timeout: Duration) -> Self {
        self.close_flush_timeout = timeout;
        self
    }

    /// Enable or disable single-connection mode.
    pub fn single_connection(mut self, enabled: bool) -> Self {
        self.single_connection = enabled;
        self
    }

    /// Address string to bind.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::InvalidMaxFrameSize(self.max_frame_size));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidReadBufferSize);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("host is required")]
    MissingHost,
    #[error("max_frame_size must be between 1 and u32::MAX, got {0}")]
    InvalidMaxFrameSize(usize),
    #[error("read_buffer_size must be positive")]
    InvalidReadBufferSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
        assert!(!config.single_connection);
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
    }

    #[test]
    fn test_builder_pattern() {
        let config = TransportConfig::default()
            .host("127.0.0.1")
            .port(0)
            .max_frame_size(1024)
            .accept_backoff(Duration::from_millis(5))
            .single_connection(true);

        assert_eq!(config.bind_addr(), "127.0.0.1:0");
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.accept_backoff, Duration::from_millis(5));
        assert!(config.single_connection);
    }

    #[test]
    fn test_bind_addr_ipv6() {
        let config = TransportConfig::default().host("::1").port(5000);
        assert_eq!(config.bind_addr(), "[::1]:5000");
    }

    #[test]
    fn test_validate_missing_host() {
        let config = TransportConfig::default().host("");
        assert!(matches!(config.validate(), Err(ConfigError::MissingHost)));
    }

    #[test]
    fn test_validate_zero_frame_size() {
        let config = TransportConfig::default().max_frame_size(0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMaxFrameSize(0))));
    }

    #[test]
    fn test_validate_ok() {
        assert!(TransportConfig::default().validate().is_ok());
    }
}
