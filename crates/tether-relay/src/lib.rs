//! # TETHER Relay
//!
//! Pairing relay for the TETHER remote-access platform.
//!
//! When a controlling client and a controlled host cannot reach each other
//! directly, both connect to a public relay and present the same
//! `(key_id, secret)` identity. The relay matches the two connections and
//! from then on forwards raw bytes between them. Payload is never inspected,
//! buffered beyond one chunk per direction, or retransmitted.
//!
//! This crate provides:
//! - Length-prefixed identity handshake with timeout ([`pending`])
//! - FIFO identity matching and registry ownership ([`manager`])
//! - Bidirectional single-buffer relaying with idle tracking ([`pair`])
//! - A bounded pool of per-pair buffers ([`pool`])
//!
//! ## Architecture
//!
//! ```text
//!   client ──┐                                        ┌── host
//!            ▼                                        ▼
//!   ┌──────────────────┐                    ┌──────────────────┐
//!   │ PendingConnection│                    │ PendingConnection│
//!   └────────┬─────────┘                    └────────┬─────────┘
//!            │ ready(key_id, secret)                 │
//!            └──────────────► SessionManager ◄───────┘
//!                                  │ match + pool checkout
//!                                  ▼
//!                            ┌───────────┐
//!                            │ RelayPair │ ◄── idle sweep
//!                            └───────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_relay::{RelayConfig, ResourcePool, SessionDelegate, SessionManager};
//!
//! struct Metrics;
//!
//! impl SessionDelegate for Metrics {
//!     fn on_session_finished(&self) {
//!         tracing::info!("relay session finished");
//!     }
//! }
//!
//! # async fn example() -> Result<(), tether_relay::RelayError> {
//! let config = RelayConfig::default();
//! let pool = ResourcePool::new(config.pool_size, config.buffer_size);
//!
//! let manager = SessionManager::bind(config).await?;
//! let handle = manager.start(pool, Arc::new(Metrics));
//!
//! // ... later
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod delegate;
pub mod error;
pub mod identity;
pub mod manager;
pub mod pair;
pub mod pending;
pub mod pool;
pub mod stats;

pub use config::{ExhaustionPolicy, RelayConfig};
pub use delegate::{ConnectionId, PairDelegate, PairId, PendingDelegate, SessionDelegate};
pub use error::{RelayError, Result};
pub use identity::{Identity, PeerToRelay};
pub use manager::{ManagerHandle, RegistrySnapshot, SessionManager};
pub use pair::{FinishReason, PairReport, RelayPair, Side};
pub use pending::{PendingConnection, PendingState, read_handshake};
pub use pool::{PoolLease, ResourcePool};
pub use stats::{ManagerStats, StatsSnapshot};
