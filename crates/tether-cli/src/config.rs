//! Configuration file for the relay daemon.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_relay::{ExhaustionPolicy, RelayConfig};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay configuration
    #[serde(default)]
    pub relay: RelaySection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[relay]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Seconds a resolved connection may wait for its peer (0 = forever)
    #[serde(default = "default_peer_wait_timeout")]
    pub peer_wait_timeout_secs: u64,
    /// Relay pair idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Idle sweep interval in seconds
    #[serde(default = "default_idle_sweep_interval")]
    pub idle_sweep_interval_secs: u64,
    /// Handshake receive buffer capacity in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Number of pooled relay resources
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-direction relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Pool exhaustion policy: reject, unpooled or wait
    #[serde(default = "default_exhaustion_policy")]
    pub exhaustion_policy: String,
    /// Maximum pending connections (0 = unlimited)
    #[serde(default)]
    pub max_pending: usize,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", tether_relay::config::DEFAULT_RELAY_PORT)
}

fn default_handshake_timeout() -> u64 {
    tether_relay::config::DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_peer_wait_timeout() -> u64 {
    tether_relay::config::DEFAULT_PEER_WAIT_TIMEOUT.as_secs()
}

fn default_idle_timeout() -> u64 {
    tether_relay::config::DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_idle_sweep_interval() -> u64 {
    tether_relay::config::DEFAULT_IDLE_SWEEP_INTERVAL.as_secs()
}

fn default_max_message_size() -> usize {
    tether_relay::config::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_pool_size() -> usize {
    tether_relay::config::DEFAULT_POOL_SIZE
}

fn default_buffer_size() -> usize {
    tether_relay::config::DEFAULT_BUFFER_SIZE
}

fn default_exhaustion_policy() -> String {
    "reject".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            handshake_timeout_secs: default_handshake_timeout(),
            peer_wait_timeout_secs: default_peer_wait_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            idle_sweep_interval_secs: default_idle_sweep_interval(),
            max_message_size: default_max_message_size(),
            pool_size: default_pool_size(),
            buffer_size: default_buffer_size(),
            exhaustion_policy: default_exhaustion_policy(),
            max_pending: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("tether/relay.toml")
    }

    /// Load config from the default path, falling back to built-in defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.listen_addr.parse()?)
    }

    /// Build the relay configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any value is invalid.
    pub fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let relay = &self.relay;
        let exhaustion_policy: ExhaustionPolicy = relay.exhaustion_policy.parse()?;

        let config = RelayConfig {
            listen_addr: self.parse_listen_addr()?,
            handshake_timeout: Duration::from_secs(relay.handshake_timeout_secs),
            peer_wait_timeout: (relay.peer_wait_timeout_secs > 0)
                .then(|| Duration::from_secs(relay.peer_wait_timeout_secs)),
            idle_timeout: Duration::from_secs(relay.idle_timeout_secs),
            idle_sweep_interval: Duration::from_secs(relay.idle_sweep_interval_secs),
            max_message_size: relay.max_message_size,
            pool_size: relay.pool_size,
            buffer_size: relay.buffer_size,
            exhaustion_policy,
            max_pending: (relay.max_pending > 0).then_some(relay.max_pending),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.relay_config()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.relay.buffer_size > 16 * 1024 * 1024 {
            anyhow::bail!("Buffer size must be at most 16MB");
        }

        Ok(())
    }
}
