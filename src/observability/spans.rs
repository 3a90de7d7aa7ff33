//! Request spans.

use tracing::Span;

use crate::http::request::Request;
use crate::net::connection::ConnectionId;

/// Span wrapping everything done for one request.
pub fn request_span(request: &Request, connection_id: ConnectionId) -> Span {
    tracing::info_span!(
        "request",
        request_id = %request.id,
        connection_id = %connection_id,
        method = %request.method,
        path = %request.path,
        peer = request.remote_endpoint.map(|addr| addr.to_string()),
    )
}
