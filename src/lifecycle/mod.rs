//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → Load web root and TLS material → Bind listeners → Serve
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast → Each server stops accepting → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Guard (guard.rs):
//!     Per-server liveness token checked by every asynchronous continuation
//! ```
//!
//! # Design Decisions
//! - Ordered startup: every listener is bound before any serves traffic
//! - Any startup error is fatal; nothing after startup is
//! - Responses already being written finish before a server reports stopped

pub mod guard;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use guard::{HandlerRunner, ScopedLock};
pub use shutdown::Shutdown;
