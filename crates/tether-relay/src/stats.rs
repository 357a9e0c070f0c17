//! Session manager counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters, updated by the manager task and readable from anywhere
#[derive(Debug, Default)]
pub struct ManagerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    accept_errors: AtomicU64,
    handshakes_failed: AtomicU64,
    pairs_formed: AtomicU64,
    pairs_finished: AtomicU64,
    pool_exhausted: AtomicU64,
    idle_reclaimed: AtomicU64,
    peer_wait_expired: AtomicU64,
    parked_expired: AtomicU64,
    bytes_relayed: AtomicU64,
}

/// Point-in-time copy of [`ManagerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sockets accepted
    pub accepted: u64,
    /// Sockets closed by admission control
    pub rejected: u64,
    /// Failed accept calls
    pub accept_errors: u64,
    /// Handshakes that failed or timed out
    pub handshakes_failed: u64,
    /// Relay pairs started
    pub pairs_formed: u64,
    /// Relay pairs finished
    pub pairs_finished: u64,
    /// Pairings that found the pool empty
    pub pool_exhausted: u64,
    /// Relay pairs terminated by the idle sweep
    pub idle_reclaimed: u64,
    /// Pending connections dropped after waiting too long for a peer
    pub peer_wait_expired: u64,
    /// Parked pairs dropped after waiting too long for a resource
    pub parked_expired: u64,
    /// Bytes forwarded by finished pairs, both directions
    pub bytes_relayed: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl ManagerStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    record_accepted => accepted,
    record_rejected => rejected,
    record_accept_error => accept_errors,
    record_handshake_failed => handshakes_failed,
    record_pair_formed => pairs_formed,
    record_pair_finished => pairs_finished,
    record_pool_exhausted => pool_exhausted,
    record_idle_reclaimed => idle_reclaimed,
    record_peer_wait_expired => peer_wait_expired,
    record_parked_expired => parked_expired,
}

impl ManagerStats {
    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            pairs_formed: self.pairs_formed.load(Ordering::Relaxed),
            pairs_finished: self.pairs_finished.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            idle_reclaimed: self.idle_reclaimed.load(Ordering::Relaxed),
            peer_wait_expired: self.peer_wait_expired.load(Ordering::Relaxed),
            parked_expired: self.parked_expired.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ManagerStats::default();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_pair_formed();
        stats.add_bytes(10);
        stats.add_bytes(5);
        stats.record_parked_expired();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.pairs_formed, 1);
        assert_eq!(snapshot.bytes_relayed, 15);
        assert_eq!(snapshot.pairs_finished, 0);
        assert_eq!(snapshot.parked_expired, 1);
        assert_eq!(snapshot.idle_reclaimed, 0);
    }
}
