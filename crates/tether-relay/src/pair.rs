//! Relay pairs: two matched sockets forwarding bytes to each other.
//!
//! Each direction keeps a single buffer in flight: read once, write the
//! whole chunk to the other side, then read again. A slow reader therefore
//! stalls its peer's writes instead of growing a queue.
//!
//! The first end of either pipeline (orderly close, I/O error, or an
//! explicit terminate) ends the pair. Both sockets are dropped together and
//! the owner hears about it exactly once.

use crate::delegate::{DelegateSlot, PairDelegate, PairId};
use crate::pool::PoolLease;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Which end of the pair an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The connection that was waiting first
    First,
    /// The connection that completed the match
    Second,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::First => f.write_str("first"),
            Side::Second => f.write_str("second"),
        }
    }
}

/// Why a relay pair ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// One side closed its connection
    Closed(Side),
    /// Read or write failed on one side
    Io {
        /// Side whose socket failed
        side: Side,
        /// Error kind
        kind: std::io::ErrorKind,
        /// Error message
        message: String,
    },
    /// No traffic for longer than the idle timeout
    IdleTimeout,
    /// The session manager is shutting down
    Shutdown,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Closed(side) => write!(f, "{side} side closed"),
            FinishReason::Io { side, message, .. } => write!(f, "{side} side error: {message}"),
            FinishReason::IdleTimeout => f.write_str("idle timeout"),
            FinishReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Final accounting of a relay pair, handed to its owner
#[derive(Debug)]
pub struct PairReport {
    /// Pair identifier
    pub id: PairId,
    /// Why the pair ended
    pub reason: FinishReason,
    /// Bytes forwarded from the first side to the second
    pub first_to_second: u64,
    /// Bytes forwarded from the second side to the first
    pub second_to_first: u64,
    /// How long the pair ran
    pub duration: Duration,
    /// The per-pair resource, to be returned to its pool
    pub lease: PoolLease,
}

impl PairReport {
    /// Total bytes forwarded in both directions
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.first_to_second + self.second_to_first
    }
}

/// Last-activity timestamp shared by both pipelines of a pair
#[derive(Debug)]
pub struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    /// Create a clock whose last activity is now
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Counters {
    first_to_second: AtomicU64,
    second_to_first: AtomicU64,
}

/// One direction: read, write the same bytes, repeat.
///
/// Returns `Ok(())` on orderly close of `reader`.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    activity: &ActivityClock,
    relayed: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        relayed.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn io_reason(side: Side, error: std::io::Error) -> FinishReason {
    FinishReason::Io {
        side,
        kind: error.kind(),
        message: error.to_string(),
    }
}

/// Relay between two streams until one side ends or `stop` resolves.
///
/// Both streams are dropped (and so closed) before this returns.
async fn relay_streams<A, B>(
    first: A,
    second: B,
    lease: &mut PoolLease,
    activity: &ActivityClock,
    counters: &Counters,
    stop: oneshot::Receiver<FinishReason>,
) -> FinishReason
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut first_read, mut first_write) = tokio::io::split(first);
    let (mut second_read, mut second_write) = tokio::io::split(second);
    let (forward_buf, backward_buf) = lease.split_mut();

    let forward = pump(
        &mut first_read,
        &mut second_write,
        forward_buf,
        activity,
        &counters.first_to_second,
    );
    let backward = pump(
        &mut second_read,
        &mut first_write,
        backward_buf,
        activity,
        &counters.second_to_first,
    );

    tokio::select! {
        result = forward => match result {
            Ok(()) => FinishReason::Closed(Side::First),
            Err(e) => io_reason(Side::First, e),
        },
        result = backward => match result {
            Ok(()) => FinishReason::Closed(Side::Second),
            Err(e) => io_reason(Side::Second, e),
        },
        reason = stop => reason.unwrap_or(FinishReason::Shutdown),
    }
}

/// Two matched sockets relayed to each other
pub struct RelayPair {
    id: PairId,
    addrs: (Option<SocketAddr>, Option<SocketAddr>),
    streams: Option<(TcpStream, TcpStream)>,
    lease: Option<PoolLease>,
    activity: Arc<ActivityClock>,
    delegate: DelegateSlot<dyn PairDelegate>,
    stop_tx: Option<oneshot::Sender<FinishReason>>,
    task: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl RelayPair {
    /// Build a pair from two sockets and a pooled resource
    pub fn new(id: PairId, first: TcpStream, second: TcpStream, lease: PoolLease) -> Self {
        Self {
            id,
            addrs: (first.peer_addr().ok(), second.peer_addr().ok()),
            streams: Some((first, second)),
            lease: Some(lease),
            activity: Arc::new(ActivityClock::new()),
            delegate: DelegateSlot::empty(),
            stop_tx: None,
            task: None,
            started_at: Instant::now(),
        }
    }

    /// Start both pipelines. Calling `start` twice has no effect.
    pub fn start(&mut self, delegate: Arc<dyn PairDelegate>) {
        let (Some((first, second)), Some(mut lease)) = (self.streams.take(), self.lease.take())
        else {
            return;
        };

        tracing::debug!(
            pair = %self.id,
            first = ?self.addrs.0,
            second = ?self.addrs.1,
            "Starting relay pair"
        );

        self.delegate = DelegateSlot::new(delegate);
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let slot = self.delegate.clone();
        let activity = Arc::clone(&self.activity);
        let id = self.id;
        let started_at = self.started_at;

        self.task = Some(tokio::spawn(async move {
            let counters = Counters::default();
            let reason =
                relay_streams(first, second, &mut lease, &activity, &counters, stop_rx).await;

            let report = PairReport {
                id,
                reason,
                first_to_second: counters.first_to_second.load(Ordering::Relaxed),
                second_to_first: counters.second_to_first.load(Ordering::Relaxed),
                duration: started_at.elapsed(),
                lease,
            };

            if let Some(delegate) = slot.take() {
                delegate.on_pair_finished(report);
            }
        }));
    }

    /// Force the pair to end as if it had failed.
    ///
    /// The owner still receives the finish notification. Returns `false` if
    /// the pair was already told to terminate or is not running.
    pub fn terminate(&mut self, reason: FinishReason) -> bool {
        match self.stop_tx.take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    /// Tear down without notifying the owner. Idempotent.
    pub fn stop(&mut self) {
        self.delegate.clear();
        self.stop_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.streams = None;
        self.lease = None;
    }

    /// Pair identifier
    #[must_use]
    pub fn id(&self) -> PairId {
        self.id
    }

    /// Time since either side last sent data
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// Time since the pair was formed
    #[must_use]
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Remote addresses of both sides
    #[must_use]
    pub fn peer_addrs(&self) -> (Option<SocketAddr>, Option<SocketAddr>) {
        self.addrs
    }
}

impl Drop for RelayPair {
    fn drop(&mut self) {
        self.stop();
    }
}
