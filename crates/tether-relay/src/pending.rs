//! Pending connections: accepted sockets running the identification handshake.
//!
//! # Handshake Flow
//!
//! ```text
//! Idle --start()--> AwaitingLength --4 bytes--> AwaitingBody --L bytes--> Ready
//!                        |                          |
//!                        +-------- error / timeout / bad length / bad body --> Failed
//! ```
//!
//! Exactly one of "ready" or "failed" is delivered per connection. After
//! [`PendingConnection::stop`] neither is.

use crate::delegate::{ConnectionId, DelegateSlot, PendingDelegate};
use crate::error::{RelayError, Result};
use crate::identity::{Identity, PeerToRelay};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

/// Handshake progress of a pending connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Created, handshake not started
    Idle,
    /// Handshake task is reading the identity message
    Handshaking,
    /// Identity received; waiting to be matched with a peer
    Ready,
    /// Handshake failed
    Failed,
    /// Torn down
    Stopped,
}

/// Read one length-prefixed identity message.
///
/// # Errors
///
/// - [`RelayError::InvalidLength`] if the declared length is zero or exceeds `capacity`
/// - [`RelayError::Io`] if the stream fails or closes early
/// - [`RelayError::Parse`] if the body is not a valid record
pub async fn read_handshake<R>(reader: &mut R, capacity: usize) -> Result<PeerToRelay>
where
    R: AsyncRead + Unpin,
{
    tracing::trace!("Reading message size");
    let length = reader.read_u32().await?;

    if length == 0 || length as usize > capacity {
        return Err(RelayError::InvalidLength { length, capacity });
    }

    tracing::trace!(length, "Reading message");
    let mut body = Zeroizing::new(vec![0u8; length as usize]);
    reader.read_exact(&mut body).await?;

    PeerToRelay::from_bytes(&body)
}

/// An accepted socket that has not been paired yet
pub struct PendingConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stream: Option<TcpStream>,
    identity: Option<Identity>,
    state: PendingState,
    delegate: DelegateSlot<dyn PendingDelegate>,
    task: Option<JoinHandle<()>>,
    handshake_timeout: Duration,
    max_message_size: usize,
    accepted_at: Instant,
    ready_at: Option<Instant>,
}

impl PendingConnection {
    /// Wrap a freshly accepted socket
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        handshake_timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            id,
            peer_addr,
            stream: Some(stream),
            identity: None,
            state: PendingState::Idle,
            delegate: DelegateSlot::empty(),
            task: None,
            handshake_timeout,
            max_message_size,
            accepted_at: Instant::now(),
            ready_at: None,
        }
    }

    /// Arm the handshake timer and start reading the identity message.
    ///
    /// The socket moves into the handshake task and comes back through
    /// [`PendingDelegate::on_pending_ready`]. Calling `start` twice has no
    /// effect.
    pub fn start(&mut self, delegate: Arc<dyn PendingDelegate>) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if self.state != PendingState::Idle {
            self.stream = Some(stream);
            return;
        }

        tracing::debug!(conn = %self.id, peer = %self.peer_addr, "Starting pending connection");

        self.state = PendingState::Handshaking;
        self.delegate = DelegateSlot::new(delegate);

        let slot = self.delegate.clone();
        let id = self.id;
        let timeout = self.handshake_timeout;
        let capacity = self.max_message_size;

        self.task = Some(tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, read_handshake(&mut stream, capacity)).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::HandshakeTimeout(timeout)),
                };

            // Whoever empties the slot first owns the terminal signal
            let Some(delegate) = slot.take() else {
                return;
            };

            match result {
                Ok(message) => delegate.on_pending_ready(id, message, stream),
                Err(error) => {
                    drop(stream);
                    delegate.on_pending_failed(id, error);
                }
            }
        }));
    }

    /// Take the socket back after a successful handshake
    pub(crate) fn complete_handshake(&mut self, stream: TcpStream) {
        self.task = None;
        self.stream = Some(stream);
        self.state = PendingState::Ready;
        self.ready_at = Some(Instant::now());
    }

    /// Record that the handshake failed
    pub(crate) fn fail_handshake(&mut self) {
        self.task = None;
        self.state = PendingState::Failed;
    }

    /// Record the identity used for matching
    pub fn set_identity(&mut self, key_id: u32, secret: &[u8]) {
        self.identity = Some(Identity::new(key_id, secret.to_vec()));
    }

    /// Whether this connection and `other` present matching identities
    #[must_use]
    pub fn is_peer_of(&self, other: &PendingConnection) -> bool {
        match (&self.identity, &other.identity) {
            (Some(mine), Some(theirs)) => mine.is_peer_of(theirs),
            _ => false,
        }
    }

    /// Move the socket out. Returns `None` on every call after the first.
    pub fn take_socket(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    /// Tear down: cancel the handshake, close the socket if still owned and
    /// detach from the owner. Idempotent.
    pub fn stop(&mut self) {
        self.delegate.clear();

        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.stream = None;

        if self.state != PendingState::Stopped {
            tracing::trace!(conn = %self.id, "Pending connection stopped");
            self.state = PendingState::Stopped;
        }
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PendingState {
        self.state
    }

    /// Identity, once the handshake has been parsed
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Time since the handshake completed, if it has
    #[must_use]
    pub fn waiting_for(&self) -> Option<Duration> {
        self.ready_at.map(|t| t.elapsed())
    }

    /// Time since the socket was accepted
    #[must_use]
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        self.stop();
    }
}
