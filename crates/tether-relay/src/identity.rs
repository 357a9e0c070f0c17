//! Identification record exchanged during the handshake.
//!
//! A peer opens its connection with a single length-prefixed frame:
//!
//! ```text
//! +----------------------+---------------------------------+
//! | length (u32, BE)     | PeerToRelay body (length bytes) |
//! +----------------------+---------------------------------+
//! ```
//!
//! After that frame the connection carries the paired peer's raw byte
//! stream with no further framing.

use crate::error::{RelayError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Identification message a peer sends to the relay
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PeerToRelay {
    /// Key identifier issued alongside the secret
    pub key_id: u32,
    /// Shared secret both endpoints present
    pub secret: Vec<u8>,
}

impl PeerToRelay {
    /// Create a new identification message
    pub fn new(key_id: u32, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id,
            secret: secret.into(),
        }
    }

    /// Serialize the message body
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Parse`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| RelayError::Parse(e.to_string()))
    }

    /// Deserialize a message body
    ///
    /// The whole slice must be consumed; trailing bytes are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Parse`] if the bytes are not a valid record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| RelayError::Parse(e.to_string()))
    }

    /// Serialize the message with its length prefix, ready to write to a socket
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Parse`] if encoding fails.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = self.to_bytes()?;
        let length = u32::try_from(body.len())
            .map_err(|_| RelayError::Parse("message body exceeds u32::MAX".to_string()))?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Extract the identity used for matching
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.key_id, self.secret.clone())
    }
}

impl fmt::Debug for PeerToRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerToRelay")
            .field("key_id", &self.key_id)
            .field("secret", &format_args!("<{} bytes>", self.secret.len()))
            .finish()
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Matching identity of a pending connection
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    key_id: u32,
    secret: Vec<u8>,
}

impl Identity {
    /// Create a new identity
    pub fn new(key_id: u32, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id,
            secret: secret.into(),
        }
    }

    /// Key identifier
    #[must_use]
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Whether no secret was presented
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }

    /// Whether two identities belong to the two ends of one session.
    ///
    /// Key identifiers and secrets must be equal and the secret must be
    /// non-empty. Two empty secrets never match.
    #[must_use]
    pub fn is_peer_of(&self, other: &Identity) -> bool {
        if self.secret.is_empty() || other.secret.is_empty() {
            return false;
        }

        self.key_id == other.key_id && self.secret == other.secret
    }

    /// Short hex fingerprint of the secret, safe to log
    #[must_use]
    pub fn fingerprint(&self) -> String {
        if self.secret.is_empty() {
            return "empty".to_string();
        }
        let hash = blake3::hash(&self.secret);
        hex::encode(&hash.as_bytes()[..4])
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
