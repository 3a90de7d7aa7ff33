//! HTTP/1.1 protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Connection (plain or TLS)
//!     → server.rs (acceptor loop, handshake, error sink)
//!     → session.rs (keep-alive loop, deadlines, error boundary)
//!     → request.rs (parse head, read body, request ID)
//!     → handler.rs (per-method or default handler)
//!     → response.rs (head, body, flush)
//!     → streaming.rs (chunked transfer of large sources)
//!     → Send to client
//! ```

pub mod handler;
pub mod request;
pub mod response;
pub mod server;
mod session;
pub mod streaming;

pub use handler::{Handler, Handlers};
pub use request::{Request, RequestId};
pub use response::{Completion, Response};
pub use server::{ErrorSink, Server, ServerHandle, ServerSettings};
pub use streaming::{ChunkSink, Progress, StreamingWriter};
