//! TLS listener tests: handshake success, required client certificates,
//! and shutdown during a pending handshake.

use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use webhost::http::{Handler, Request, Response};
use webhost::net::TlsContext;
use webhost::{ErrorKind, Result, Server};

mod common;
use common::{read_response, send, ErrorLog, TestHost, CERT, KEY};

struct Hello;

impl Handler for Hello {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response<'_>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { response.write_status(StatusCode::OK, format!("hello {}", request.path)) })
    }
}

fn tls_server(verify_clients: bool) -> (Server, ErrorLog) {
    let verify = verify_clients.then_some(CERT);
    let context = TlsContext::from_pem(CERT, KEY, verify).unwrap();
    let mut server = Server::https(common::settings(), context);
    server.default_resource(Hello);
    let errors = ErrorLog::default();
    errors.attach(&mut server);
    (server, errors)
}

#[tokio::test]
async fn serves_requests_over_tls() {
    let (server, errors) = tls_server(false);
    let host = TestHost::start(server).await;

    let mut stream = common::tls_connect(host.addr).await.unwrap();
    send(&mut stream, "GET /secure HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    let first = read_response(&mut stream).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.text(), "hello /secure");

    send(&mut stream, "GET /again HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    let second = read_response(&mut stream).await;
    assert_eq!(second.text(), "hello /again");
    assert_eq!(second.header("connection").as_deref(), Some("close"));

    assert!(errors.kinds().is_empty());
    host.stop().await;
}

#[tokio::test]
async fn missing_client_certificate_is_reported_once_and_listener_survives() {
    let (server, errors) = tls_server(true);
    let host = TestHost::start(server).await;

    // TLS 1.3 clients finish before the server checks the certificate, so the
    // rejection may only surface on the first read.
    if let Ok(mut stream) = common::tls_connect(host.addr).await {
        let _ = stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await;
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
        assert!(buf.is_empty());
    }
    assert_eq!(errors.wait_for(1).await, vec![ErrorKind::Handshake]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(errors.kinds().len(), 1);

    // The listener keeps accepting.
    let _ = common::tls_connect(host.addr).await;
    assert_eq!(
        errors.wait_for(2).await,
        vec![ErrorKind::Handshake, ErrorKind::Handshake]
    );

    host.stop().await;
}

#[tokio::test]
async fn plain_text_client_fails_handshake() {
    let (server, errors) = tls_server(false);
    let host = TestHost::start(server).await;

    let mut stream = host.connect().await;
    send(&mut stream, "GET / HTTP/1.1\r\n\r\n").await;
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    assert!(!String::from_utf8_lossy(&buf).contains("HTTP/1.1"));
    assert_eq!(errors.wait_for(1).await, vec![ErrorKind::Handshake]);

    host.stop().await;
}

#[tokio::test]
async fn stop_aborts_pending_handshake_without_reporting() {
    let (server, errors) = tls_server(false);
    let host = TestHost::start(server).await;

    // Connect but never send a ClientHello.
    let mut silent = host.connect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.handle.active_connections(), 1);

    let started = std::time::Instant::now();
    let errors_after = errors.clone();
    host.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut buf = Vec::new();
    let _ = silent.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert!(errors_after.kinds().is_empty());
}
