//! Asynchronous HTTP/HTTPS web host.
//!
//! Accepts connections, optionally negotiates TLS, reads requests under
//! per-connection deadlines and streams responses in bounded chunks. Every
//! asynchronous continuation is gated by a per-server liveness guard so a
//! stopping server never starts new work.

pub mod config;
pub mod error;
pub mod files;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::WebhostConfig;
pub use error::{Error, ErrorKind, Result};
pub use http::{Server, ServerHandle, ServerSettings};
pub use lifecycle::Shutdown;
