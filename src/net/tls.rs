//! TLS listener context and server-side handshake controller.
//!
//! # Responsibilities
//! - Load certificate chain, private key and optional client root store once
//! - Derive the per-listener session-id context after bind, before any accept
//! - Drive the handshake of each accepted socket: Idle → Handshaking → Established | Failed
//!
//! Certificate material is immutable after construction and shared by every
//! handshake through an `Arc<ServerConfig>`.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ServerSessionMemoryCache, StoresServerSessions, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Operation, Result};
use crate::net::connection::Connection;
use crate::net::transport::Transport;

/// Longest session-id context OpenSSL-compatible stacks accept.
pub const MAX_SESSION_ID_CONTEXT_LEN: usize = 32;

const SESSION_CACHE_SIZE: usize = 256;

/// Certificate material for an encrypted listener.
#[derive(Clone)]
pub struct TlsContext {
    config: ServerConfig,
    verify_peer: bool,
}

impl TlsContext {
    /// Load PEM files. `verify_path` enables required client certificates.
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        verify_path: Option<&Path>,
    ) -> Result<Self> {
        let chain = read_certs(cert_path)?;
        let key = read_key(key_path)?;
        let roots = verify_path.map(read_certs).transpose()?;
        Self::from_parts(chain, key, roots)
    }

    /// Same as [`from_pem_files`](Self::from_pem_files) with in-memory PEM data.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], verify_pem: Option<&[u8]>) -> Result<Self> {
        let chain = parse_certs(cert_pem, "certificate chain")?;
        let key = parse_key(key_pem)?;
        let roots = verify_pem
            .map(|pem| parse_certs(pem, "verify file"))
            .transpose()?;
        Self::from_parts(chain, key, roots)
    }

    fn from_parts(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: Option<Vec<CertificateDer<'static>>>,
    ) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfig(e.to_string()))?;

        let verify_peer = client_roots.is_some();
        let builder = match client_roots {
            None => builder.with_no_client_auth(),
            Some(certs) => {
                let verifier = client_verifier(certs, provider)?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder
            .with_single_cert(chain, key)
            .map_err(|e| Error::TlsConfig(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        tracing::debug!(verify_peer, "TLS context loaded");
        Ok(Self {
            config,
            verify_peer,
        })
    }

    pub fn requires_peer_certificate(&self) -> bool {
        self.verify_peer
    }

    /// Build the acceptor for a bound listener.
    ///
    /// With peer verification enabled the session cache is scoped by the
    /// listener's session-id context so caches from different listeners or
    /// restarts never resolve each other's sessions.
    pub fn acceptor(&self, address: &str, local_addr: SocketAddr) -> TlsAcceptor {
        let mut config = self.config.clone();
        if self.verify_peer {
            let context = session_id_context(address, local_addr.port());
            tracing::debug!(
                context = %String::from_utf8_lossy(&context),
                "Session id context configured"
            );
            config.session_storage = Arc::new(ScopedSessionCache {
                context,
                inner: ServerSessionMemoryCache::new(SESSION_CACHE_SIZE),
            });
        }
        TlsAcceptor::from(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

fn client_verifier(
    certs: Vec<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(Error::TlsConfig(format!(
            "verify file contains no usable root certificates ({ignored} rejected)"
        )));
    }
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| Error::TlsConfig(e.to_string()))
}

/// `"<port>:<address reversed>"`, cut to [`MAX_SESSION_ID_CONTEXT_LEN`] bytes.
///
/// The address is reversed so that truncation drops its common prefix
/// rather than its distinguishing tail.
pub fn session_id_context(address: &str, port: u16) -> Vec<u8> {
    let mut context = format!("{port}:").into_bytes();
    context.extend(address.bytes().rev());
    context.truncate(MAX_SESSION_ID_CONTEXT_LEN);
    context
}

/// Session store whose keys are prefixed with a listener-specific context.
#[derive(Debug)]
struct ScopedSessionCache {
    context: Vec<u8>,
    inner: Arc<ServerSessionMemoryCache>,
}

impl ScopedSessionCache {
    fn scoped(&self, key: &[u8]) -> Vec<u8> {
        let mut scoped = Vec::with_capacity(self.context.len() + key.len());
        scoped.extend_from_slice(&self.context);
        scoped.extend_from_slice(key);
        scoped
    }
}

impl StoresServerSessions for ScopedSessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.inner.put(self.scoped(&key), value)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(&self.scoped(key))
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.take(&self.scoped(key))
    }

    fn can_cache(&self) -> bool {
        self.inner.can_cache()
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::TlsConfig(format!("cannot open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::TlsConfig(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::TlsConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::TlsConfig(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsConfig(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::TlsConfig(format!("no private key found in {}", path.display())))
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::TlsConfig(format!("{what}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::TlsConfig(format!("no certificates found in {what}")));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| Error::TlsConfig(format!("private key: {e}")))?
        .ok_or_else(|| Error::TlsConfig("no private key found".into()))
}

/// Handshake progress for one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Handshaking,
    Established,
    Failed,
}

/// Drives the server side of one TLS negotiation.
pub struct HandshakeController {
    acceptor: TlsAcceptor,
    state: HandshakeState,
}

impl HandshakeController {
    pub fn new(acceptor: TlsAcceptor) -> Self {
        Self {
            acceptor,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Negotiate on `conn`, bounded by `timeout`.
    ///
    /// On failure the socket is dropped and the error is returned for the
    /// caller to report; it never propagates past the connection.
    pub async fn drive(
        &mut self,
        mut conn: Connection<TcpStream>,
        timeout: Duration,
    ) -> Result<Connection<Transport>> {
        let connection_id = conn.id();
        self.transition(HandshakeState::Handshaking, connection_id);
        conn.set_timeout(Operation::Handshake, timeout);

        let acceptor = self.acceptor.clone();
        let result = conn
            .upgrade(|tcp| async move { acceptor.accept(tcp).await.map(Transport::from) })
            .await;

        match result {
            Ok(conn) => {
                self.transition(HandshakeState::Established, connection_id);
                if let Some(info) = conn.stream().tls_info() {
                    tracing::debug!(
                        connection_id = %connection_id,
                        version = ?info.protocol_version,
                        cipher_suite = ?info.cipher_suite,
                        peer = ?info.peer,
                        "TLS session established"
                    );
                }
                Ok(conn)
            }
            Err(e) => {
                self.transition(HandshakeState::Failed, connection_id);
                crate::observability::metrics::handshake_failed();
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: HandshakeState, connection_id: impl std::fmt::Display) {
        tracing::trace!(
            connection_id = %connection_id,
            from = ?self.state,
            to = ?next,
            "Handshake state change"
        );
        self.state = next;
    }
}
