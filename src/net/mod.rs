//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, accept, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → transport.rs (plain or encrypted byte stream)
//!     → connection.rs (deadlines, read buffer, lifecycle tracking)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Handshaking → Reading ⇄ Serving → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;
pub mod transport;

pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionTracker};
pub use listener::{BindOptions, Listener};
pub use tls::{HandshakeController, HandshakeState, TlsContext};
pub use transport::Transport;
