//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Acceptor, handshake, session, streaming:
//!     → logging.rs (subscriber setup, structured events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → spans.rs (per-request span with request ID)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID is attached to every event emitted while serving a request
//! - Metric updates are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
pub mod spans;
