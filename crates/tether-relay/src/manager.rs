//! Session manager: accepts sockets, pairs them by identity and supervises
//! the resulting relay pairs.
//!
//! # Architecture
//!
//! One task owns everything: the listener, the pending registry, the active
//! registry and the resource pool. Pending connections and relay pairs run
//! their I/O in their own tasks and report back through an event channel, so
//! every registry mutation happens on the manager task.
//!
//! ```text
//! accept --> PendingConnection --ready--> match? --yes--> RelayPair --finished--> release
//!                  |                        |
//!                failed                     no --> wait in registry
//! ```
//!
//! Events that refer to an id no longer in a registry are stale completions
//! from torn-down objects and are dropped.

use crate::config::{ExhaustionPolicy, MAX_DURATION, RelayConfig};
use crate::delegate::{
    ConnectionId, PairDelegate, PairId, PendingDelegate, SessionDelegate,
};
use crate::error::{RelayError, Result};
use crate::identity::PeerToRelay;
use crate::pair::{FinishReason, PairReport, RelayPair};
use crate::pending::{PendingConnection, PendingState};
use crate::pool::{PoolLease, ResourcePool};
use crate::stats::{ManagerStats, StatsSnapshot};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// First pause after a failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest pause between accept retries
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before retrying after `failures` consecutive accept errors.
///
/// Doubles from [`ACCEPT_BACKOFF_MIN`] up to [`ACCEPT_BACKOFF_MAX`].
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Completion reported to the manager task
enum ManagerEvent {
    HandshakeReady {
        id: ConnectionId,
        message: PeerToRelay,
        stream: TcpStream,
    },
    HandshakeFailed {
        id: ConnectionId,
        error: RelayError,
    },
    PairFinished(PairReport),
}

/// Requests from a [`ManagerHandle`]
enum Command {
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    Shutdown,
}

/// Delegate handed to pending connections and relay pairs
struct EventLink {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl PendingDelegate for EventLink {
    fn on_pending_ready(&self, id: ConnectionId, message: PeerToRelay, stream: TcpStream) {
        // A closed channel means the manager is gone; the socket is dropped
        let _ = self.tx.send(ManagerEvent::HandshakeReady {
            id,
            message,
            stream,
        });
    }

    fn on_pending_failed(&self, id: ConnectionId, error: RelayError) {
        let _ = self.tx.send(ManagerEvent::HandshakeFailed { id, error });
    }
}

impl PairDelegate for EventLink {
    fn on_pair_finished(&self, report: PairReport) {
        let _ = self.tx.send(ManagerEvent::PairFinished(report));
    }
}

/// Sizes of the manager's registries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Pending connections, handshaking or waiting
    pub pending: usize,
    /// Pending connections with a resolved identity and no peer yet
    pub waiting_for_peer: usize,
    /// Matched socket pairs waiting for a pool resource
    pub parked: usize,
    /// Running relay pairs
    pub active: usize,
}

impl RegistrySnapshot {
    /// Whether every registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.parked == 0 && self.active == 0
    }
}

/// Matched sockets waiting for a resource under [`ExhaustionPolicy::Wait`]
struct ParkedPair {
    first: TcpStream,
    second: TcpStream,
    since: Instant,
}

/// Relay server that pairs connections presenting the same identity
pub struct SessionManager {
    listener: TcpListener,
    config: RelayConfig,
}

impl SessionManager {
    /// Validate the configuration and bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] for an invalid configuration or
    /// [`RelayError::Io`] if binding fails.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await?;

        tracing::info!(
            addr = %listener.local_addr()?,
            idle_timeout = ?config.idle_timeout,
            handshake_timeout = ?config.handshake_timeout,
            "Relay listening"
        );

        Ok(Self { listener, config })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Io`] if the address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting and pairing connections.
    ///
    /// Takes ownership of `pool`; `delegate` hears about finished sessions.
    /// Must be called from within a tokio runtime.
    pub fn start(self, pool: ResourcePool, delegate: Arc<dyn SessionDelegate>) -> ManagerHandle {
        let local_addr = self.listener.local_addr().ok();
        let stats = Arc::new(ManagerStats::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let core = ManagerCore {
            listener: self.listener,
            config: self.config,
            pool,
            delegate,
            link: Arc::new(EventLink { tx: events_tx }),
            pending: BTreeMap::new(),
            active: BTreeMap::new(),
            parked: VecDeque::new(),
            next_connection: 0,
            next_pair: 0,
            accept_failures: 0,
            stats: Arc::clone(&stats),
        };

        let task = tokio::spawn(core.run(events_rx, commands_rx));

        ManagerHandle {
            commands: commands_tx,
            stats,
            local_addr,
            task: Some(task),
        }
    }
}

/// Handle to a running session manager.
///
/// Dropping the handle stops the manager.
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    stats: Arc<ManagerStats>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl ManagerHandle {
    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Cumulative counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current registry sizes
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ManagerClosed`] if the manager has stopped.
    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| RelayError::ManagerClosed)?;
        rx.await.map_err(|_| RelayError::ManagerClosed)
    }

    /// Stop listening, tear down every connection and wait for the manager
    /// task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Session manager task ended abnormally: {}", e);
            }
        }
    }

    /// Whether the manager task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }
}

struct ManagerCore {
    listener: TcpListener,
    config: RelayConfig,
    pool: ResourcePool,
    delegate: Arc<dyn SessionDelegate>,
    link: Arc<EventLink>,
    pending: BTreeMap<ConnectionId, PendingConnection>,
    active: BTreeMap<PairId, RelayPair>,
    parked: VecDeque<ParkedPair>,
    next_connection: u64,
    next_pair: u64,
    accept_failures: u32,
    stats: Arc<ManagerStats>,
}

impl ManagerCore {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let interval = self.config.idle_sweep_interval;
        let now = tokio::time::Instant::now();
        let first_sweep = now.checked_add(interval).unwrap_or(now + MAX_DURATION);
        let mut sweep = tokio::time::interval_at(first_sweep, interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.accept_failures = 0;
                        self.on_accept(stream, peer_addr);
                    }
                    Err(e) => {
                        self.stats.record_accept_error();
                        self.accept_failures = self.accept_failures.saturating_add(1);
                        let backoff = accept_backoff(self.accept_failures);
                        tracing::warn!(
                            failures = self.accept_failures,
                            backoff = ?backoff,
                            "Accept failed: {}",
                            e
                        );
                        // Persistent errors such as EMFILE would otherwise spin the loop
                        tokio::time::sleep(backoff).await;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                _ = sweep.tick() => self.on_idle_sweep(),
                command = commands.recv() => match command {
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        self.shutdown();
    }

    fn on_accept(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        self.stats.record_accepted();

        if let Some(limit) = self.config.max_pending {
            if self.pending.len() >= limit {
                self.stats.record_rejected();
                tracing::warn!(peer = %peer_addr, limit, "Pending registry full, closing connection");
                return;
            }
        }

        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);

        tracing::info!(conn = %id, peer = %peer_addr, "New pending connection");

        let mut pending = PendingConnection::new(
            id,
            stream,
            peer_addr,
            self.config.handshake_timeout,
            self.config.max_message_size,
        );
        pending.start(Arc::clone(&self.link) as Arc<dyn PendingDelegate>);
        self.pending.insert(id, pending);
    }

    fn on_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::HandshakeReady {
                id,
                message,
                stream,
            } => self.on_handshake_ready(id, &message, stream),
            ManagerEvent::HandshakeFailed { id, error } => self.on_handshake_failed(id, error),
            ManagerEvent::PairFinished(report) => self.on_pair_finished(report),
        }
    }

    fn on_handshake_ready(&mut self, id: ConnectionId, message: &PeerToRelay, stream: TcpStream) {
        let Some(pending) = self.pending.get_mut(&id) else {
            tracing::debug!(conn = %id, "Dropping stale handshake completion");
            return;
        };

        pending.complete_handshake(stream);
        pending.set_identity(message.key_id, &message.secret);

        let fingerprint = pending
            .identity()
            .map(|identity| identity.fingerprint())
            .unwrap_or_default();

        let Some(peer_id) = self.find_peer(id) else {
            tracing::info!(
                conn = %id,
                key_id = message.key_id,
                fingerprint = %fingerprint,
                "Waiting for peer"
            );
            return;
        };

        tracing::info!(
            first = %peer_id,
            second = %id,
            key_id = message.key_id,
            fingerprint = %fingerprint,
            "Peers matched"
        );

        let first = self.pending.remove(&peer_id).and_then(|mut p| p.take_socket());
        let second = self.pending.remove(&id).and_then(|mut p| p.take_socket());

        match (first, second) {
            (Some(first), Some(second)) => self.form_pair(first, second),
            _ => tracing::error!(first = %peer_id, second = %id, "Matched connection lost its socket"),
        }
    }

    /// Earliest other pending connection whose identity matches `id`'s
    fn find_peer(&self, id: ConnectionId) -> Option<ConnectionId> {
        let this = self.pending.get(&id)?;
        self.pending
            .values()
            .find(|other| other.id() != id && other.is_peer_of(this))
            .map(PendingConnection::id)
    }

    fn form_pair(&mut self, first: TcpStream, second: TcpStream) {
        let lease = match self.pool.checkout() {
            Ok(lease) => lease,
            Err(error) => {
                self.stats.record_pool_exhausted();
                self.delegate.on_pool_exhausted();

                match self.config.exhaustion_policy {
                    ExhaustionPolicy::Reject => {
                        tracing::warn!("{}; closing matched connections", error);
                        return;
                    }
                    ExhaustionPolicy::Unpooled => {
                        tracing::warn!("{}; using an unpooled buffer", error);
                        self.pool.unpooled()
                    }
                    ExhaustionPolicy::Wait => {
                        tracing::warn!(
                            parked = self.parked.len() + 1,
                            "{}; parking matched connections",
                            error
                        );
                        self.parked.push_back(ParkedPair {
                            first,
                            second,
                            since: Instant::now(),
                        });
                        return;
                    }
                }
            }
        };

        self.spawn_pair(first, second, lease);
    }

    fn spawn_pair(&mut self, first: TcpStream, second: TcpStream, lease: PoolLease) {
        self.next_pair += 1;
        let id = PairId(self.next_pair);

        let mut pair = RelayPair::new(id, first, second, lease);
        let (first_addr, second_addr) = pair.peer_addrs();
        pair.start(Arc::clone(&self.link) as Arc<dyn PairDelegate>);
        self.active.insert(id, pair);

        self.stats.record_pair_formed();
        tracing::info!(
            pair = %id,
            first = ?first_addr,
            second = ?second_addr,
            active = self.active.len(),
            "Relay pair started"
        );
        self.delegate.on_session_started();
    }

    fn on_handshake_failed(&mut self, id: ConnectionId, error: RelayError) {
        let Some(mut pending) = self.pending.remove(&id) else {
            tracing::debug!(conn = %id, "Dropping stale handshake failure");
            return;
        };

        pending.fail_handshake();
        pending.stop();
        self.stats.record_handshake_failed();

        // Timeouts and malformed input are routine client behavior
        if error.is_handshake_error() {
            tracing::info!(
                conn = %id,
                peer = %pending.peer_addr(),
                age = ?pending.age(),
                "Handshake failed: {}",
                error
            );
        } else {
            tracing::warn!(conn = %id, peer = %pending.peer_addr(), "Handshake failed: {}", error);
        }
    }

    fn on_pair_finished(&mut self, report: PairReport) {
        let Some(mut pair) = self.active.remove(&report.id) else {
            tracing::debug!(pair = %report.id, "Dropping stale pair completion");
            return;
        };
        pair.stop();

        self.stats.record_pair_finished();
        self.stats.add_bytes(report.total_bytes());

        tracing::info!(
            pair = %report.id,
            reason = %report.reason,
            sent = report.first_to_second,
            received = report.second_to_first,
            duration = ?report.duration,
            "Relay pair finished"
        );

        let pooled = report.lease.is_pooled();
        self.pool.release(report.lease);
        if pooled {
            self.unpark();
        }

        self.delegate.on_session_finished();
    }

    /// Hand freed resources to parked pairs, oldest first
    fn unpark(&mut self) {
        while !self.parked.is_empty() {
            let Ok(lease) = self.pool.checkout() else {
                return;
            };
            if let Some(parked) = self.parked.pop_front() {
                tracing::debug!(waited = ?parked.since.elapsed(), "Unparking matched connections");
                self.spawn_pair(parked.first, parked.second, lease);
            }
        }
    }

    fn on_idle_sweep(&mut self) {
        let idle_timeout = self.config.idle_timeout;

        for pair in self.active.values_mut() {
            if pair.idle_for() > idle_timeout && pair.terminate(FinishReason::IdleTimeout) {
                self.stats.record_idle_reclaimed();
                tracing::info!(pair = %pair.id(), idle = ?pair.idle_for(), "Reclaiming idle relay pair");
            }
        }

        if let Some(wait_timeout) = self.config.peer_wait_timeout {
            let expired: Vec<ConnectionId> = self
                .pending
                .values()
                .filter(|p| p.state() == PendingState::Ready)
                .filter(|p| p.waiting_for().is_some_and(|w| w > wait_timeout))
                .map(PendingConnection::id)
                .collect();

            for id in expired {
                if let Some(mut pending) = self.pending.remove(&id) {
                    pending.stop();
                    self.stats.record_peer_wait_expired();
                    tracing::info!(conn = %id, "No peer arrived in time, closing connection");
                }
            }
        }

        let before = self.parked.len();
        self.parked.retain(|p| p.since.elapsed() <= idle_timeout);
        let dropped = before - self.parked.len();
        if dropped > 0 {
            for _ in 0..dropped {
                self.stats.record_parked_expired();
            }
            tracing::info!(dropped, "Dropped parked connections");
        }

        tracing::debug!(
            pending = self.pending.len(),
            active = self.active.len(),
            parked = self.parked.len(),
            "Idle sweep complete"
        );
    }

    fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            pending: self.pending.len(),
            waiting_for_peer: self
                .pending
                .values()
                .filter(|p| p.state() == PendingState::Ready)
                .count(),
            parked: self.parked.len(),
            active: self.active.len(),
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(
            pending = self.pending.len(),
            active = self.active.len(),
            parked = self.parked.len(),
            "Session manager shutting down"
        );

        for pending in self.pending.values_mut() {
            pending.stop();
        }
        self.pending.clear();

        for pair in self.active.values_mut() {
            pair.stop();
        }
        self.active.clear();

        self.parked.clear();
    }
}
