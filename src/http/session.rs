//! Per-connection request loop.
//!
//! ```text
//! arm request deadline → read request → cancel deadline → lock runner
//!     → handler → flush response → keep-alive? ─yes─▶ next request
//!                                              └no──▶ close
//! ```
//!
//! Reads and writes strictly alternate: the next read starts only after the
//! previous response finished, so a connection never has two operations
//! outstanding.

use std::time::Instant;

use hyper::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

use crate::error::{Error, Operation, Result};
use crate::http::request::{read_request, Request};
use crate::http::response::{Completion, Response};
use crate::http::server::Shared;
use crate::net::connection::Connection;
use crate::observability::{metrics, spans};

/// Serve requests on `conn` until it closes, fails or the server stops.
pub(crate) async fn serve<S>(mut conn: Connection<S>, shared: &Shared)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut served = 0u64;
    loop {
        conn.set_timeout(Operation::ReadRequest, shared.settings.timeout_request);
        let result = read_request(&mut conn, shared.settings.max_request_streambuf_size).await;
        conn.cancel_timeout();

        let Some(lock) = conn.continue_lock() else {
            break;
        };
        let request = match result {
            Ok(request) => request,
            Err(Error::ConnectionClosed | Error::Aborted) => break,
            Err(e) if !e.tears_down_connection() => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Rejecting request");
                if let Err(write_err) = reject(&mut conn, &e, shared).await {
                    shared.report(&lock, None, &write_err);
                }
                break;
            }
            Err(e) => {
                shared.report(&lock, None, &e);
                break;
            }
        };
        // A response that has started is finished even if the server stops meanwhile.
        drop(lock);

        let span = spans::request_span(&request, conn.id());
        let outcome = respond(&mut conn, &request, shared).instrument(span).await;
        served += 1;
        match outcome {
            Ok(Completion::KeepAlive) => continue,
            Ok(Completion::Close) => break,
            Err(e) => {
                if let Some(lock) = conn.continue_lock() {
                    shared.report(&lock, Some(&request), &e);
                }
                break;
            }
        }
    }

    tracing::debug!(connection_id = %conn.id(), requests = served, "Session finished");
    conn.close().await;
}

async fn respond<S>(conn: &mut Connection<S>, request: &Request, shared: &Shared) -> Result<Completion>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let mut response = Response::new(
        conn.writer(),
        request.version,
        request.keep_alive(),
        shared.settings.timeout_content,
    );

    let outcome = match shared.handlers.resolve(&request.method) {
        Some(handler) => handler.call(request, &mut response).await,
        None => Err(Error::client(StatusCode::NOT_FOUND, "Not Found")),
    };

    if let Err(e) = outcome {
        if e.tears_down_connection() {
            return Err(e);
        }
        if !response.reset() {
            tracing::warn!(error = %e, "Handler failed after headers were sent");
            return Ok(Completion::Close);
        }
        tracing::debug!(status = e.status().as_u16(), error = %e, "Handler error");
        response.write_status(e.status(), e.to_string())?;
    }

    let status = response.status();
    let completion = response.finish().await?;
    let elapsed = started.elapsed();
    metrics::record_request(&request.method, status, elapsed);
    tracing::info!(
        status = status.as_u16(),
        duration_ms = elapsed.as_millis() as u64,
        "Request completed"
    );
    Ok(completion)
}

/// Answer a request that could not be read, then let the caller close.
async fn reject<S>(conn: &mut Connection<S>, error: &Error, shared: &Shared) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut response = Response::new(
        conn.writer(),
        Version::HTTP_11,
        false,
        shared.settings.timeout_content,
    );
    response.write_status(error.status(), error.to_string())?;
    response.finish().await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::{Handler, Handlers};
    use crate::http::server::{ErrorSink, ServerSettings};
    use crate::lifecycle::guard::HandlerRunner;
    use futures_util::future::BoxFuture;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

    /// Fails the test if a write is issued while a read is still pending.
    struct Exclusive<S> {
        inner: S,
        reading: bool,
    }

    impl<S: AsyncRead + Unpin> AsyncRead for Exclusive<S> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
            self.reading = poll.is_pending();
            poll
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for Exclusive<S> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            assert!(!self.reading, "write issued while a read is outstanding");
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    impl Handler for Echo {
        fn call<'a>(
            &'a self,
            request: &'a Request,
            response: &'a mut Response<'_>,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if request.path == "/fail" {
                    return Err(Error::bad_request("no such thing"));
                }
                let body = format!("{} {} {}", request.method, request.path, request.body.len());
                response.write_status(StatusCode::OK, body)
            })
        }
    }

    struct Harness {
        runner: Arc<HandlerRunner>,
        shared: Arc<Shared>,
        calls: Arc<AtomicUsize>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new(settings: ServerSettings) -> Self {
            let runner = HandlerRunner::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let errors = Arc::new(Mutex::new(Vec::new()));
            let mut handlers = Handlers::new();
            handlers.set_default(Echo {
                calls: Arc::clone(&calls),
            });
            let sink: ErrorSink = {
                let errors = Arc::clone(&errors);
                Arc::new(move |_req: Option<&Request>, err: &Error| {
                    errors.lock().unwrap().push(err.to_string())
                })
            };
            let shared = Arc::new(Shared::new(settings, handlers, Some(sink), &runner));
            Self {
                runner,
                shared,
                calls,
                errors,
            }
        }

        fn spawn(&self) -> (DuplexStream, tokio::task::JoinHandle<()>) {
            let (client, server) = duplex(64 * 1024);
            let conn = Connection::new(
                Exclusive {
                    inner: server,
                    reading: false,
                },
                &self.runner,
            );
            let shared = Arc::clone(&self.shared);
            let task = tokio::spawn(async move { serve(conn, &shared).await });
            (client, task)
        }

        async fn exchange(&self, input: &[u8]) -> String {
            let (mut client, task) = self.spawn();
            client.write_all(input).await.unwrap();
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            task.await.unwrap();
            String::from_utf8(out).unwrap()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn keep_alive_serves_requests_in_order() {
        let harness = Harness::new(ServerSettings::default());
        let out = harness
            .exchange(
                b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n\
                  POST /two HTTP/1.1\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
            )
            .await;
        let first = out.find("GET /one 0").unwrap();
        let second = out.find("POST /two 3").unwrap();
        assert!(first < second);
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert!(harness.errors().is_empty());
    }

    #[tokio::test]
    async fn clean_close_between_requests_is_not_an_error() {
        let harness = Harness::new(ServerSettings::default());
        let (mut client, task) = harness.spawn();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));
        client.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(harness.errors().is_empty());
    }

    #[tokio::test]
    async fn oversized_request_gets_413_without_handler() {
        let harness = Harness::new(ServerSettings {
            max_request_streambuf_size: 64,
            ..ServerSettings::default()
        });
        let out = harness
            .exchange(b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n")
            .await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");
        assert!(out.contains("connection: close\r\n"));
        assert_eq!(harness.calls.load(Ordering::SeqCst), 0);
        assert!(harness.errors().is_empty());
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let harness = Harness::new(ServerSettings::default());
        let out = harness.exchange(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
        assert_eq!(harness.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_becomes_response_and_connection_continues() {
        let harness = Harness::new(ServerSettings::default());
        let out = harness
            .exchange(
                b"GET /fail HTTP/1.1\r\n\r\n\
                  GET /after HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
        assert!(out.contains("no such thing"));
        assert!(out.contains("GET /after 0"));
        assert!(harness.errors().is_empty());
    }

    #[tokio::test]
    async fn unmatched_method_gets_404() {
        let runner = HandlerRunner::new();
        let shared = Shared::new(ServerSettings::default(), Handlers::new(), None, &runner);
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"DELETE /x HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        serve(Connection::new(server, &runner), &shared).await;
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_times_out_and_is_reported() {
        let harness = Harness::new(ServerSettings::default());
        let (_client, task) = harness.spawn();
        task.await.unwrap();
        assert_eq!(harness.errors(), vec!["request read timed out after 5s".to_string()]);
    }

    #[tokio::test]
    async fn stop_closes_idle_connection_silently() {
        let harness = Harness::new(ServerSettings::default());
        let (mut client, task) = harness.spawn();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0);

        harness.runner.begin_stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(harness.errors().is_empty());
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
