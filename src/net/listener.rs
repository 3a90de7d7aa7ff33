//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address with address reuse
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Report accept errors without stopping the acceptor
//! - Classify peer-level accept errors as transient

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

const BACKLOG: u32 = 1024;

/// Address and limits for one listening socket.
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// Host part as configured; also feeds the TLS session-id context.
    pub address: String,
    pub port: u16,
    pub max_connections: usize,
    pub reuse_address: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 8080,
            max_connections: 10_000,
            reuse_address: true,
        }
    }
}

impl BindOptions {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = if self.address.is_empty() {
            IpAddr::from([0, 0, 0, 0])
        } else {
            self.address.parse().map_err(|e| {
                Error::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
            })?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
#[derive(Debug)]
pub struct Listener {
    inner: tokio::net::TcpListener,
    /// Configured host, kept for the session-id context.
    address: String,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub async fn bind(options: &BindOptions) -> Result<Self> {
        let addr = options.socket_addr()?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(Error::Bind)?;
        socket
            .set_reuseaddr(options.reuse_address)
            .map_err(Error::Bind)?;
        socket.bind(addr).map_err(Error::Bind)?;
        let listener = socket.listen(BACKLOG).map_err(Error::Bind)?;

        let local_addr = listener.local_addr().map_err(Error::Bind)?;
        tracing::info!(
            address = %local_addr,
            max_connections = options.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            address: options.address.clone(),
            connection_limit: Arc::new(Semaphore::new(options.max_connections)),
            max_connections: options.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| Error::Aborted)?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Accept failures caused by a single peer; the next accept can proceed at once.
pub fn is_transient_accept_error(err: &Error) -> bool {
    match err {
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
