//! Startup orchestration.
//!
//! # Responsibilities
//! - Load the web root and TLS material named by the configuration
//! - Build the plain and encrypted servers with the site handlers
//! - Bind every listener before any of them serves traffic
//! - Run all servers until the stop future resolves, then drain them
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;

use futures_util::future::BoxFuture;
use hyper::Method;
use tokio::task::JoinSet;

use crate::config::WebhostConfig;
use crate::error::{Error, Result};
use crate::files::StaticFiles;
use crate::http::handler::Handler;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::server::Server;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::Listener;
use crate::net::tls::TlsContext;

/// Site handler: logs request parameters, then serves the web root.
#[derive(Debug, Clone)]
pub struct Site {
    files: StaticFiles,
}

impl Site {
    pub fn new(files: StaticFiles) -> Self {
        Self { files }
    }
}

impl Handler for Site {
    fn call<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response<'_>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !request.query_string.is_empty() {
                tracing::info!(query = ?request.query_pairs(), "Query parameters");
            }
            if request.method == Method::POST && !request.body.is_empty() {
                tracing::info!(form = ?request.form_pairs(), "Form parameters");
            }
            self.files.serve(request, response).await
        })
    }
}

/// A server with its listener already bound.
#[derive(Debug)]
pub struct BoundServer {
    server: Server,
    listener: Listener,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &Server {
        &self.server
    }
}

/// Build and bind every server the configuration enables.
pub async fn bind_all(config: &WebhostConfig) -> Result<Vec<BoundServer>> {
    let files = StaticFiles::new(&config.files.web_root, config.files.chunk_size).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("web root {:?}: {}", config.files.web_root, e),
        ))
    })?;
    let site = Site::new(files);

    let mut servers = Vec::new();
    if config.listener.enabled {
        servers.push(Server::http(config.plain_settings()));
    }
    if let (Some(tls), Some(settings)) = (&config.tls, config.tls_settings()) {
        let context = TlsContext::from_pem_files(
            Path::new(&tls.cert_path),
            Path::new(&tls.key_path),
            tls.verify_path.as_deref().map(Path::new),
        )?;
        tracing::info!(
            cert_path = %tls.cert_path,
            verify_peer = context.requires_peer_certificate(),
            "TLS context loaded"
        );
        servers.push(Server::https(settings, context));
    }

    let mut bound = Vec::with_capacity(servers.len());
    for mut server in servers {
        server
            .default_resource(site.clone())
            .resource(Method::POST, site.clone())
            .on_error(|request: Option<&Request>, error: &Error| {
                tracing::warn!(
                    request_id = request.map(|r| r.id.to_string()),
                    path = request.map(|r| r.path.clone()),
                    kind = error.kind().as_str(),
                    error = %error,
                    "Connection failed"
                );
            });
        let listener = server.bind().await?;
        bound.push(BoundServer { server, listener });
    }
    Ok(bound)
}

/// Serve until `stop` resolves, then stop every server and wait for them.
pub async fn serve(bound: Vec<BoundServer>, stop: impl Future<Output = ()>) -> Result<()> {
    let shutdown = Shutdown::new();
    let mut tasks = JoinSet::new();
    for BoundServer { server, listener } in bound {
        tasks.spawn(server.run(listener, shutdown.subscribe()));
    }

    stop.await;
    shutdown.trigger();

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Server failed");
                first_error.get_or_insert(e);
            }
            Err(e) => tracing::error!(error = %e, "Server task panicked"),
        }
    }
    first_error.map_or(Ok(()), Err)
}
