//! Relay configuration

use crate::error::{RelayError, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 8890;

/// Default handshake timeout (30 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a resolved connection may wait for its peer (2 minutes)
pub const DEFAULT_PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default relay pair idle timeout (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default idle sweep interval (1 minute)
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default handshake receive buffer capacity
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

/// Default number of pooled per-pair resources
pub const DEFAULT_POOL_SIZE: usize = 256;

/// Default per-direction relay buffer size (16 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound for every configured duration (30 days)
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// What to do when a pair forms and the resource pool is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Close both matched sockets
    #[default]
    Reject,
    /// Allocate a buffer outside the pool for this pair
    Unpooled,
    /// Park the matched sockets until a resource is released
    Wait,
}

impl std::str::FromStr for ExhaustionPolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "unpooled" => Ok(Self::Unpooled),
            "wait" => Ok(Self::Wait),
            other => Err(RelayError::invalid_config(format!(
                "unknown exhaustion policy '{other}' (expected reject, unpooled or wait)"
            ))),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the acceptor binds to
    pub listen_addr: SocketAddr,

    /// Time allowed for the identification handshake
    pub handshake_timeout: Duration,

    /// Time a resolved but unmatched connection may wait (None = forever)
    pub peer_wait_timeout: Option<Duration>,

    /// Relay pairs with no traffic for this long are reclaimed
    pub idle_timeout: Duration,

    /// Interval of the idle sweep
    pub idle_sweep_interval: Duration,

    /// Handshake receive buffer capacity
    pub max_message_size: usize,

    /// Number of pooled per-pair resources
    pub pool_size: usize,

    /// Per-direction relay buffer size
    pub buffer_size: usize,

    /// Behaviour when the pool is empty at pairing time
    pub exhaustion_policy: ExhaustionPolicy,

    /// Maximum number of pending connections (None = unlimited)
    pub max_pending: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            peer_wait_timeout: Some(DEFAULT_PEER_WAIT_TIMEOUT),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            exhaustion_policy: ExhaustionPolicy::default(),
            max_pending: None,
        }
    }
}

impl RelayConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("handshake timeout", Some(self.handshake_timeout)),
            ("peer wait timeout", self.peer_wait_timeout),
            ("idle timeout", Some(self.idle_timeout)),
            ("idle sweep interval", Some(self.idle_sweep_interval)),
        ];
        for (name, duration) in durations {
            if duration.is_some_and(|d| d > MAX_DURATION) {
                return Err(RelayError::invalid_config(format!(
                    "{name} must be at most {} days",
                    MAX_DURATION.as_secs() / 86_400
                )));
            }
        }

        if self.handshake_timeout.is_zero() {
            return Err(RelayError::invalid_config("handshake timeout must be non-zero"));
        }
        if self.peer_wait_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RelayError::invalid_config("peer wait timeout must be non-zero"));
        }
        if self.idle_timeout.is_zero() {
            return Err(RelayError::invalid_config("idle timeout must be non-zero"));
        }
        if self.idle_sweep_interval.is_zero() {
            return Err(RelayError::invalid_config("idle sweep interval must be non-zero"));
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(RelayError::invalid_config(
                "max message size must be between 1 and u32::MAX",
            ));
        }
        if self.pool_size == 0 {
            return Err(RelayError::invalid_config("pool size must be non-zero"));
        }
        if self.buffer_size == 0 {
            return Err(RelayError::invalid_config("buffer size must be non-zero"));
        }
        if self.max_pending == Some(0) {
            return Err(RelayError::invalid_config("max pending must be non-zero"));
        }
        Ok(())
    }
}
