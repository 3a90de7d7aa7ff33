//! Error taxonomy for the connection engine.
//!
//! # Categories
//! - Transport: peer reset, abrupt close, I/O failure
//! - Timeout: a deadline expired on a handshake, request read or response write
//! - Handshake: TLS negotiation or peer verification failed
//! - Protocol: malformed or oversized request
//! - Handler: resource-level failure raised by a handler (missing file, path escape)
//!
//! Only transport, timeout and handshake errors tear a connection down.
//! Protocol and handler errors become client-error responses whenever a
//! response can still be sent.

use std::fmt;
use std::time::Duration;

use hyper::StatusCode;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The asynchronous step a deadline was attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Handshake,
    ReadRequest,
    WriteResponse,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Handshake => f.write_str("TLS handshake"),
            Operation::ReadRequest => f.write_str("request read"),
            Operation::WriteResponse => f.write_str("response write"),
        }
    }
}

/// Coarse classification used for metrics labels and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Handshake,
    Protocol,
    Handler,
    Shutdown,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Handshake => "handshake",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Handler => "handler",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Config => "config",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure on the underlying socket.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before sending another request.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },

    /// The pending step was cancelled because the server is stopping.
    #[error("operation aborted: server is shutting down")]
    Aborted,

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("request exceeds maximum buffer size of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("malformed request: {0}")]
    Parse(String),

    /// Raised by handlers; converted into a response carrying `status`.
    #[error("{message}")]
    Handler { status: StatusCode, message: String },

    #[error("response headers have already been written")]
    HeadersAlreadyWritten,
}

impl Error {
    /// A handler-path error answered with `400 Bad Request`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::client(StatusCode::BAD_REQUEST, message)
    }

    /// A handler-path error answered with the given status.
    pub fn client(status: StatusCode, message: impl Into<String>) -> Self {
        Error::Handler {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ConnectionClosed => ErrorKind::Transport,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Aborted => ErrorKind::Shutdown,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::TlsConfig(_) | Error::Bind(_) => ErrorKind::Config,
            Error::PayloadTooLarge { .. } | Error::Parse(_) => ErrorKind::Protocol,
            Error::Handler { .. } | Error::HeadersAlreadyWritten => ErrorKind::Handler,
        }
    }

    /// Whether this error ends the connection it occurred on.
    pub fn tears_down_connection(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Handler)
    }

    /// Status used when the error can still be answered with a response.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Handler { status, .. } => *status,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Parse(_) => StatusCode::BAD_REQUEST,
            Error::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Timeouts and transport failures are indistinguishable to the peer but not to operators.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
