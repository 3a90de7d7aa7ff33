//! Server: acceptor loop, per-connection dispatch and the error sink.
//!
//! # Responsibilities
//! - Bind the listener and build the TLS acceptor once the port is known
//! - Accept sockets until the handler runner begins stopping
//! - Run the handshake (encrypted servers) and then the session loop per connection
//! - Report connection-level failures to the error sink
//! - Wait for every live connection to finish before `run` returns
//!
//! # Cancellation
//! Every continuation (accept completion, handshake completion, request read
//! completion) takes a [`ScopedLock`] from the [`HandlerRunner`] before it
//! touches shared state. Once [`ServerHandle::stop`] is called no new socket
//! is accepted and pending handshakes and reads are aborted; responses that
//! are already being written run to completion.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use hyper::Method;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::http::handler::{Handler, Handlers};
use crate::http::request::Request;
use crate::http::session;
use crate::lifecycle::guard::{self, HandlerRunner, ScopedLock};
use crate::net::connection::{Connection, ConnectionTracker};
use crate::net::listener::{is_transient_accept_error, BindOptions, Listener};
use crate::net::tls::{HandshakeController, TlsContext};
use crate::net::transport::Transport;
use crate::observability::metrics;

/// Default bound on request head plus body.
pub const DEFAULT_MAX_REQUEST_STREAMBUF_SIZE: usize = 8 * 1024 * 1024;

/// Pause after an accept error that is likely to repeat.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Callback receiving connection-level failures.
///
/// The request is present when the failure happened while serving one.
pub type ErrorSink = Arc<dyn Fn(Option<&Request>, &Error) + Send + Sync>;

/// Per-server tunables.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: BindOptions,
    /// Deadline for the handshake and for reading each request.
    pub timeout_request: Duration,
    /// Deadline for each response flush.
    pub timeout_content: Duration,
    pub max_request_streambuf_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: BindOptions::default(),
            timeout_request: Duration::from_secs(5),
            timeout_content: Duration::from_secs(300),
            max_request_streambuf_size: DEFAULT_MAX_REQUEST_STREAMBUF_SIZE,
        }
    }
}

enum Protocol {
    Http,
    Https(TlsContext),
}

impl Protocol {
    fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https(_) => "https",
        }
    }
}

/// State shared by every connection task of one server.
pub(crate) struct Shared {
    pub(crate) settings: ServerSettings,
    pub(crate) handlers: Handlers,
    on_error: Option<ErrorSink>,
    runner: Weak<HandlerRunner>,
}

impl Shared {
    pub(crate) fn new(
        settings: ServerSettings,
        handlers: Handlers,
        on_error: Option<ErrorSink>,
        runner: &Arc<HandlerRunner>,
    ) -> Self {
        Self {
            settings,
            handlers,
            on_error,
            runner: Arc::downgrade(runner),
        }
    }

    /// Hand a failure to the error sink. Requires a live lock.
    pub(crate) fn report(&self, _lock: &ScopedLock, request: Option<&Request>, error: &Error) {
        metrics::connection_error(error.kind());
        tracing::debug!(
            kind = error.kind().as_str(),
            request_id = request.map(|r| r.id.to_string()),
            error = %error,
            "Connection error"
        );
        if let Some(sink) = &self.on_error {
            sink(request, error);
        }
    }
}

/// An HTTP or HTTPS server.
pub struct Server {
    settings: ServerSettings,
    protocol: Protocol,
    handlers: Handlers,
    on_error: Option<ErrorSink>,
    runner: Arc<HandlerRunner>,
    tracker: ConnectionTracker,
}

impl Server {
    /// A plain-text server.
    pub fn http(settings: ServerSettings) -> Self {
        Self::with_protocol(settings, Protocol::Http)
    }

    /// A TLS server using `tls` for every connection.
    pub fn https(settings: ServerSettings, tls: TlsContext) -> Self {
        Self::with_protocol(settings, Protocol::Https(tls))
    }

    fn with_protocol(settings: ServerSettings, protocol: Protocol) -> Self {
        Self {
            settings,
            protocol,
            handlers: Handlers::new(),
            on_error: None,
            runner: HandlerRunner::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Register `handler` for requests with `method`.
    pub fn resource(&mut self, method: Method, handler: impl Handler) -> &mut Self {
        self.handlers.insert(method, handler);
        self
    }

    /// Register the handler for methods without their own entry.
    pub fn default_resource(&mut self, handler: impl Handler) -> &mut Self {
        self.handlers.set_default(handler);
        self
    }

    pub fn on_error<F>(&mut self, sink: F) -> &mut Self
    where
        F: Fn(Option<&Request>, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(sink));
        self
    }

    /// Handle for stopping the server from another task.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            runner: Arc::clone(&self.runner),
            tracker: self.tracker.clone(),
        }
    }

    pub async fn bind(&self) -> Result<Listener> {
        Listener::bind(&self.settings.bind).await
    }

    /// Bind and serve until stopped.
    pub async fn start(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener, shutdown).await
    }

    /// Serve `listener` until `shutdown` fires or [`ServerHandle::stop`] is called.
    ///
    /// Returns after the acceptor has exited and every connection has closed.
    pub async fn run(self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let acceptor = match &self.protocol {
            Protocol::Http => None,
            Protocol::Https(tls) => Some(tls.acceptor(listener.address(), local_addr)),
        };
        let shared = Arc::new(Shared::new(
            self.settings.clone(),
            self.handlers.clone(),
            self.on_error.clone(),
            &self.runner,
        ));

        tracing::info!(
            address = %local_addr,
            scheme = self.protocol.scheme(),
            max_connections = listener.max_connections(),
            "Server accepting connections"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    self.runner.begin_stop();
                    None
                }
                _ = self.runner.stopped() => None,
                accepted = listener.accept() => Some(accepted),
            };

            let Some(lock) = self.runner.try_acquire() else {
                break;
            };
            let Some(accepted) = accepted else {
                continue;
            };

            match accepted {
                Ok((tcp, peer_addr, permit)) => {
                    metrics::connection_accepted();
                    let conn = Connection::new(tcp, &self.runner)
                        .with_peer_addr(peer_addr)
                        .with_permit(permit)
                        .tracked(self.tracker.track());
                    tracing::debug!(
                        connection_id = %conn.id(),
                        peer = %peer_addr,
                        "Accepted connection"
                    );
                    tokio::spawn(serve_connection(conn, Arc::clone(&shared), acceptor.clone()));
                }
                Err(Error::Aborted) => break,
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::debug!(error = %e, "Transient accept error");
                }
                Err(e) => {
                    // Persistent failures such as descriptor exhaustion would
                    // otherwise spin the acceptor.
                    shared.report(&lock, None, &e);
                    drop(lock);
                    tokio::select! {
                        _ = self.runner.stopped() => {}
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        drop(listener);
        tracing::info!(
            address = %local_addr,
            active_connections = self.tracker.active_count(),
            "Acceptor stopped; draining connections"
        );
        self.tracker.wait_for_idle().await;
        tracing::info!(address = %local_addr, "Server stopped");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("settings", &self.settings)
            .field("scheme", &self.protocol.scheme())
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// Stops a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    runner: Arc<HandlerRunner>,
    tracker: ConnectionTracker,
}

impl ServerHandle {
    /// Stop accepting and abort idle connections. Idempotent.
    pub fn stop(&self) {
        self.runner.begin_stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.runner.is_stopping()
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }
}

async fn serve_connection(
    conn: Connection<TcpStream>,
    shared: Arc<Shared>,
    acceptor: Option<TlsAcceptor>,
) {
    if let Err(e) = conn.stream().set_nodelay(true) {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Failed to set TCP_NODELAY");
    }

    let conn = match acceptor {
        None => conn.map_stream(Transport::Plain),
        Some(acceptor) => {
            let mut controller = HandshakeController::new(acceptor);
            let result = controller
                .drive(conn, shared.settings.timeout_request)
                .await;
            let Some(lock) = guard::continue_lock(&shared.runner) else {
                return;
            };
            match result {
                Ok(conn) => conn,
                Err(Error::Aborted) => return,
                Err(e) => {
                    shared.report(&lock, None, &e);
                    return;
                }
            }
        }
    };

    session::serve(conn, &shared).await;
}
