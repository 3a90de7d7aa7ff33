//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use webhost::lifecycle::Shutdown;
use webhost::net::BindOptions;
use webhost::{Error, ErrorKind, Server, ServerHandle, ServerSettings};

pub const CERT: &[u8] = include_bytes!("../fixtures/localhost.crt");
pub const KEY: &[u8] = include_bytes!("../fixtures/localhost.key");

/// Settings bound to an ephemeral loopback port.
pub fn settings() -> ServerSettings {
    ServerSettings {
        bind: BindOptions {
            address: "127.0.0.1".into(),
            port: 0,
            max_connections: 64,
            reuse_address: true,
        },
        ..ServerSettings::default()
    }
}

/// Errors handed to a server's error sink.
#[derive(Clone, Default)]
pub struct ErrorLog(Arc<Mutex<Vec<ErrorKind>>>);

impl ErrorLog {
    pub fn attach(&self, server: &mut Server) {
        let log = self.0.clone();
        server.on_error(move |_request, error: &Error| log.lock().unwrap().push(error.kind()));
    }

    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.0.lock().unwrap().clone()
    }

    /// Wait until at least `count` errors were reported.
    pub async fn wait_for(&self, count: usize) -> Vec<ErrorKind> {
        for _ in 0..200 {
            if self.0.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.kinds()
    }
}

/// A running server on an ephemeral port.
pub struct TestHost {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub shutdown: Shutdown,
    pub task: JoinHandle<webhost::Result<()>>,
}

impl TestHost {
    pub async fn start(server: Server) -> Self {
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = server.handle();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(server.run(listener, shutdown.subscribe()));
        Self {
            addr,
            handle,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Stop the server and wait for `run` to return.
    pub async fn stop(self) {
        self.handle.stop();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// A parsed response: status code, raw head, body.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }
}

/// Read one response head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> (u16, String) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    (status, head)
}

/// Read one response delimited by `Content-Length`.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> RawResponse {
    let (status, head) = read_head(stream).await;
    let mut response = RawResponse {
        status,
        head,
        body: Vec::new(),
    };
    let length: usize = response
        .header("content-length")
        .expect("response without content-length")
        .parse()
        .unwrap();
    response.body = vec![0u8; length];
    stream.read_exact(&mut response.body).await.unwrap();
    response
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, request: &str) {
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

/// Accepts any server certificate. The fixtures are self-signed.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client connector without a client certificate.
pub fn tls_connector() -> TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn tls_connect(addr: SocketAddr) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").unwrap();
    tls_connector().connect(name, tcp).await
}

/// A web root with an index page and `size` bytes in `big.bin`.
pub fn web_root(size: usize) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>webhost</h1>").unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/index.html"), "docs").unwrap();
    std::fs::write(dir.path().join("big.bin"), big_payload(size)).unwrap();
    dir
}

pub fn big_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
