//! Connection ownership, deadlines and lifecycle tracking.
//!
//! # Responsibilities
//! - Own exactly one transport plus the bytes read from it but not yet parsed
//! - Arm a deadline for the pending handshake/read and cancel it afterwards
//! - Abort pending reads and handshakes when the server begins stopping
//! - Generate unique connection IDs for tracing
//! - Count live connections so shutdown can wait for them to drain
//!
//! Every I/O method takes `&mut self`, so at most one operation is ever
//! outstanding on a connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Operation, Result};
use crate::lifecycle::guard::{self, HandlerRunner, ScopedLock};
use crate::net::listener::ConnectionPermit;
use crate::net::transport::Transport;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8 * 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the connection is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TLS negotiation in progress.
    Handshaking,
    /// Waiting for (more of) a request.
    Reading,
    /// A response is being produced.
    Serving,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
    operation: Operation,
}

/// One accepted client: transport, read buffer and pending-operation deadline.
pub struct Connection<S = Transport> {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    stream: S,
    read_buf: BytesMut,
    deadline: Option<Deadline>,
    runner: Weak<HandlerRunner>,
    state: ConnectionState,
    _tracked: Option<ConnectionGuard>,
    _permit: Option<ConnectionPermit>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, runner: &Arc<HandlerRunner>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr: None,
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            deadline: None,
            runner: Arc::downgrade(runner),
            state: ConnectionState::Reading,
            _tracked: None,
            _permit: None,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Attach a tracker slot; the connection adopts the slot's id.
    pub fn tracked(mut self, guard: ConnectionGuard) -> Self {
        self.id = guard.id();
        self._tracked = Some(guard);
        self
    }

    pub fn with_permit(mut self, permit: ConnectionPermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Arm the deadline for the next handshake or read.
    pub fn set_timeout(&mut self, operation: Operation, timeout: Duration) {
        self.deadline = Some(Deadline {
            at: Instant::now() + timeout,
            timeout,
            operation,
        });
    }

    pub fn cancel_timeout(&mut self) {
        self.deadline = None;
    }

    /// Lock the server's runner for the synchronous part of a continuation.
    pub fn continue_lock(&self) -> Option<ScopedLock> {
        guard::continue_lock(&self.runner)
    }

    /// Bytes received but not yet consumed by the parser.
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// Remove and return the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) -> BytesMut {
        self.read_buf.split_to(n)
    }

    /// Discard the first `n` buffered bytes.
    pub fn advance(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    /// Read more bytes from the transport into the buffer.
    ///
    /// Returns `0` on end of stream. Bounded by the armed deadline and
    /// aborted when the server begins stopping.
    pub async fn fill_buf(&mut self) -> Result<usize> {
        self.state = ConnectionState::Reading;
        self.read_buf.reserve(READ_CHUNK);
        let deadline = self.deadline;
        let read = self.stream.read_buf(&mut self.read_buf);
        unless_stopping(&self.runner, with_deadline(deadline, read)).await
    }

    /// Writer handed to the response sink.
    pub fn writer(&mut self) -> &mut S {
        self.state = ConnectionState::Serving;
        &mut self.stream
    }

    /// Replace the transport with one produced by `handshake`.
    ///
    /// I/O errors from the handshake are reported as [`Error::Handshake`];
    /// the armed deadline and shutdown still apply.
    pub async fn upgrade<T, F, Fut>(mut self, handshake: F) -> Result<Connection<T>>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.state = ConnectionState::Handshaking;
        let deadline = self.deadline;
        let runner = self.runner.clone();
        let Connection {
            id,
            peer_addr,
            stream,
            read_buf,
            _tracked,
            _permit,
            ..
        } = self;

        let stream = unless_stopping(&runner, with_deadline(deadline, handshake(stream)))
            .await
            .map_err(|e| match e {
                Error::Io(io) => Error::Handshake(io),
                other => other,
            })?;

        Ok(Connection {
            id,
            peer_addr,
            stream,
            read_buf,
            deadline: None,
            runner,
            state: ConnectionState::Reading,
            _tracked,
            _permit,
        })
    }

    /// Wrap the transport without any I/O, e.g. plain TCP into [`Transport`].
    pub fn map_stream<T>(self, wrap: impl FnOnce(S) -> T) -> Connection<T> {
        let Connection {
            id,
            peer_addr,
            stream,
            read_buf,
            deadline,
            runner,
            state,
            _tracked,
            _permit,
        } = self;
        Connection {
            id,
            peer_addr,
            stream: wrap(stream),
            read_buf,
            deadline,
            runner,
            state,
            _tracked,
            _permit,
        }
    }

    /// Shut the write side down and drop the connection.
    pub async fn close(mut self) {
        self.state = ConnectionState::Closed;
        let _ = tokio::time::timeout(CLOSE_GRACE, self.stream.shutdown()).await;
        tracing::trace!(connection_id = %self.id, "Connection shut down");
    }
}

async fn with_deadline<T, F>(deadline: Option<Deadline>, op: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline.at, op).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                operation: deadline.operation,
                timeout: deadline.timeout,
            }),
        },
        None => op.await.map_err(Error::from),
    }
}

async fn unless_stopping<T, F>(runner: &Weak<HandlerRunner>, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(runner) = runner.upgrade() else {
        return Err(Error::Aborted);
    };
    tokio::select! {
        biased;
        _ = runner.stopped() => Err(Error::Aborted),
        result = op => result,
    }
}

/// Tracks live connections so shutdown can wait for them to drain.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new live connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active.send_modify(|count| *count += 1);
        crate::observability::metrics::connection_opened();
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until every tracked connection has been dropped.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count = count.saturating_sub(1));
        crate::observability::metrics::connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
