//! Error types for the relay core.
//!
//! Every error here is local to the object that produced it. A failed
//! handshake discards one pending connection, a failed pipeline ends one
//! relay pair, and pool exhaustion affects one pairing attempt. Nothing in
//! this module is fatal to the session manager.

use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    // ============ Handshake Errors ============
    /// The identity message did not arrive before the handshake timer fired
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Declared message length is zero or larger than the receive buffer
    #[error("Invalid message length {length} (capacity {capacity})")]
    InvalidLength {
        /// Length announced by the peer
        length: u32,
        /// Receive buffer capacity
        capacity: usize,
    },

    /// Message body could not be decoded into an identity record
    #[error("Failed to parse identity message: {0}")]
    Parse(String),

    // ============ Socket Errors ============
    /// Accept, read or write failure
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    // ============ Resource Errors ============
    /// No resource left in the pool
    #[error("Resource pool exhausted ({capacity} resources in use)")]
    PoolExhausted {
        /// Fixed pool size
        capacity: usize,
    },

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// The session manager task is no longer running
    #[error("Session manager is closed")]
    ManagerClosed,
}

impl RelayError {
    /// Whether this error belongs to the identification handshake phase
    #[must_use]
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout(_) | Self::InvalidLength { .. } | Self::Parse(_)
        ) || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Result alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
