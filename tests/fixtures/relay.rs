//! Relay test fixture for integration testing
//!
//! Starts a session manager on an ephemeral loopback port and provides
//! helpers for connecting peers and observing the registries.
//!
//! # Example
//!
//! ```no_run
//! use tether_integration_tests::fixtures::RelayFixture;
//!
//! #[tokio::test]
//! async fn test_basic_pairing() {
//!     let fixture = RelayFixture::new().await.unwrap();
//!     let mut client = fixture.connect(42, b"abcdefgh").await.unwrap();
//!     let mut host = fixture.connect(42, b"abcdefgh").await.unwrap();
//!     fixture.wait_for(|s| s.active == 1).await;
//!     // ... exchange bytes ...
//!     fixture.cleanup().await;
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_relay::{
    ManagerHandle, PeerToRelay, RegistrySnapshot, RelayConfig, RelayError, ResourcePool,
    SessionDelegate, SessionManager, StatsSnapshot,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// How long [`RelayFixture::wait_for`] polls before giving up
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval for registry snapshots
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session delegate that counts every notification
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    started: AtomicUsize,
    finished: AtomicUsize,
    exhausted: AtomicUsize,
}

impl RecordingDelegate {
    /// Sessions started so far
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Session-finished notifications so far
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Pool exhaustion notifications so far
    pub fn exhausted(&self) -> usize {
        self.exhausted.load(Ordering::SeqCst)
    }
}

impl SessionDelegate for RecordingDelegate {
    fn on_session_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pool_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::SeqCst);
    }
}

/// A running relay bound to loopback
pub struct RelayFixture {
    handle: Option<ManagerHandle>,
    /// Address peers connect to
    pub addr: SocketAddr,
    /// Delegate observing session lifecycle
    pub delegate: Arc<RecordingDelegate>,
}

impl RelayFixture {
    /// Start a relay with test defaults and a pool of 8 resources
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn new() -> Result<Self, RelayError> {
        Self::with_config(Self::test_config(), 8).await
    }

    /// Configuration used by [`RelayFixture::new`]
    ///
    /// Binds to an ephemeral loopback port so tests can run concurrently.
    pub fn test_config() -> RelayConfig {
        RelayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            handshake_timeout: Duration::from_secs(5),
            idle_sweep_interval: Duration::from_secs(60),
            buffer_size: 4096,
            ..RelayConfig::default()
        }
    }

    /// Start a relay with a custom configuration and pool size
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the listener
    /// cannot be bound.
    pub async fn with_config(config: RelayConfig, pool_size: usize) -> Result<Self, RelayError> {
        let buffer_size = config.buffer_size;
        let manager = SessionManager::bind(config).await?;
        let pool = ResourcePool::new(pool_size, buffer_size);
        let addr = manager.local_addr()?;
        let delegate = Arc::new(RecordingDelegate::default());
        let handle = manager.start(pool, Arc::clone(&delegate) as Arc<dyn SessionDelegate>);

        Ok(Self {
            handle: Some(handle),
            addr,
            delegate,
        })
    }

    /// Connect and present an identity
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the write fails.
    pub async fn connect(&self, key_id: u32, secret: &[u8]) -> Result<TcpStream, RelayError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let frame = PeerToRelay::new(key_id, secret.to_vec()).encode_frame()?;
        stream.write_all(&frame).await?;
        Ok(stream)
    }

    /// Connect and send arbitrary bytes instead of a handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the write fails.
    pub async fn connect_raw(&self, bytes: &[u8]) -> Result<TcpStream, RelayError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(bytes).await?;
        Ok(stream)
    }

    /// Connect two peers with the same identity and wait until they are paired
    ///
    /// # Errors
    ///
    /// Returns an error if either connection fails.
    pub async fn connect_pair(
        &self,
        key_id: u32,
        secret: &[u8],
    ) -> Result<(TcpStream, TcpStream), RelayError> {
        let before = self.stats().pairs_formed;
        let first = self.connect(key_id, secret).await?;
        self.wait_for(|s| s.waiting_for_peer >= 1).await;
        let second = self.connect(key_id, secret).await?;

        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.stats().pairs_formed <= before {
            assert!(
                tokio::time::Instant::now() < deadline,
                "peers were never paired"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok((first, second))
    }

    /// Current registry sizes
    ///
    /// # Panics
    ///
    /// Panics if the relay has been shut down.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.handle()
            .snapshot()
            .await
            .expect("relay is running")
    }

    /// Cumulative counters
    pub fn stats(&self) -> StatsSnapshot {
        self.handle().stats()
    }

    /// Poll the registries until `predicate` holds
    ///
    /// # Panics
    ///
    /// Panics if the state is not reached within five seconds.
    pub async fn wait_for<F>(&self, mut predicate: F) -> RegistrySnapshot
    where
        F: FnMut(&RegistrySnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let snapshot = self.snapshot().await;
            if predicate(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "registry never reached the expected state, last: {snapshot:?}"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Shut the relay down and wait for the manager task
    pub async fn cleanup(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }

    fn handle(&self) -> &ManagerHandle {
        self.handle.as_ref().expect("relay is running")
    }
}
