use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port to listen on
    pub port: u16,

    /// Number of worker threads
    pub threads: usize,

    /// Path to the durable store file (None for memory-only)
    pub persist_path: Option<String>,

    /// Debounce window for persistence flushes
    pub flush_interval_ms: u64,

    /// How often a steady connection is pinged
    pub keep_alive_interval_ms: u64,

    /// Silence after which a connection is dropped
    pub liveness_timeout_ms: u64,

    /// Deadline for receiving the client Hello
    pub handshake_timeout_ms: u64,

    /// Maximum queued notifications per connection before a resync is forced
    pub outbound_queue_capacity: usize,

    /// Connection buffer size (per connection)
    pub connection_buffer_size: usize,

    /// Largest accepted frame body
    pub max_message_size: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// How far behind the current sequence an update may be and still apply
    pub reorder_tolerance: u64,

    /// Name reported in logs
    pub server_name: String,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 1735,
            threads: num_cpus::get(),
            persist_path: Some("networktables.json".to_string()),
            flush_interval_ms: 1000,
            keep_alive_interval_ms: 1000,
            liveness_timeout_ms: 5000,
            handshake_timeout_ms: 3000,
            outbound_queue_capacity: 4096,
            connection_buffer_size: 16 * 1024, // 16KB
            max_message_size: 1024 * 1024,
            tcp_nodelay: true,
            reorder_tolerance: 0,
            server_name: "ntsync".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ntsync_server::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("ntsync.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(Error::Config(reason.to_string()));

        if self.threads == 0 {
            return invalid("threads must be > 0");
        }

        if self.port == 0 {
            return invalid("port must be > 0");
        }

        if self.connection_buffer_size < 1024 {
            return invalid("connection_buffer_size must be >= 1024");
        }

        if self.outbound_queue_capacity < 16 {
            return invalid("outbound_queue_capacity must be >= 16");
        }

        if self.handshake_timeout_ms == 0 {
            return invalid("handshake_timeout_ms must be > 0");
        }

        if self.liveness_timeout_ms <= self.keep_alive_interval_ms {
            return invalid("liveness_timeout_ms must exceed keep_alive_interval_ms");
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
