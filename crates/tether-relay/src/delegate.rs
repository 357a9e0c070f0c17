//! Callback interfaces between the relay components.
//!
//! Pending connections and relay pairs report back to the session manager
//! through [`PendingDelegate`] and [`PairDelegate`]. They reach the manager
//! through a [`DelegateSlot`], which teardown clears. A completion that
//! races with teardown finds the slot empty and does nothing.

use crate::error::RelayError;
use crate::identity::PeerToRelay;
use crate::pair::PairReport;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

/// Identifier of a pending connection, assigned in accept order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identifier of a relay pair, assigned in pairing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairId(pub u64);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pair#{}", self.0)
    }
}

/// Receives the outcome of a pending connection's handshake
pub trait PendingDelegate: Send + Sync {
    /// The identity message was read and parsed; the socket is handed back
    fn on_pending_ready(&self, id: ConnectionId, message: PeerToRelay, stream: TcpStream);

    /// The handshake failed; the socket has been closed
    fn on_pending_failed(&self, id: ConnectionId, error: RelayError);
}

/// Receives the end of a relay pair
pub trait PairDelegate: Send + Sync {
    /// Both sockets are closed and the pipelines stopped
    fn on_pair_finished(&self, report: PairReport);
}

/// Externally visible lifecycle events of the session manager
pub trait SessionDelegate: Send + Sync {
    /// One relay session ended
    fn on_session_finished(&self);

    /// A relay session started
    fn on_session_started(&self) {}

    /// A pairing found the resource pool empty
    fn on_pool_exhausted(&self) {}
}

/// Clearable reference to a delegate.
///
/// [`take`](Self::take) empties the slot, so whoever takes the delegate is
/// the only party allowed to deliver the terminal signal.
pub struct DelegateSlot<D: ?Sized> {
    inner: Arc<Mutex<Option<Arc<D>>>>,
}

impl<D: ?Sized> DelegateSlot<D> {
    /// Create a slot holding `delegate`
    pub fn new(delegate: Arc<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(delegate))),
        }
    }

    /// Create an empty slot
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the delegate out, leaving the slot empty
    pub fn take(&self) -> Option<Arc<D>> {
        match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Clear the slot
    pub fn clear(&self) {
        drop(self.take());
    }

    /// Whether the delegate is still attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl<D: ?Sized> Clone for DelegateSlot<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
