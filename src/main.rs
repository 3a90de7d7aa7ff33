//! Web host binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!                  │                   WEBHOST                    │
//!   Client         │  ┌──────────┐   ┌───────────┐   ┌─────────┐  │
//!   ───────────────┼─▶│ listener │──▶│ handshake │──▶│ session │  │
//!                  │  │ + limits │   │  (TLS)    │   │  loop   │  │
//!                  │  └──────────┘   └───────────┘   └────┬────┘  │
//!                  │                                      ▼       │
//!   ◀──────────────┼──────── response ◀── streaming ◀── handler   │
//!                  │                                              │
//!                  │  guard (stop) · config · observability       │
//!                  └──────────────────────────────────────────────┘
//! ```
//!
//! Serves the web root on the plain listener and, when configured, on the
//! TLS listener. SIGINT or SIGTERM stops both.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use webhost::config::{load_config, validate_config, ConfigError, WebhostConfig};
use webhost::lifecycle::{signals, startup};
use webhost::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "webhost")]
#[command(about = "Asynchronous HTTP/HTTPS static web host", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plain listener port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve.
    #[arg(long)]
    web_root: Option<String>,

    /// Only run the TLS listener.
    #[arg(long)]
    no_plain: bool,
}

impl Cli {
    fn load(&self) -> Result<WebhostConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => WebhostConfig::default(),
        };
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(web_root) = &self.web_root {
            config.files.web_root = web_root.clone();
        }
        if self.no_plain {
            config.listener.enabled = false;
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load()?;

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        plain_port = config.listener.enabled.then_some(config.listener.port),
        tls_port = config.tls.as_ref().map(|tls| tls.port),
        web_root = %config.files.web_root,
        thread_pool_size = config.runtime.thread_pool_size,
        "webhost starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.thread_pool_size)
        .thread_name("webhost-worker")
        .enable_all()
        .build()?;
    runtime.block_on(run(config))?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run(config: WebhostConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let bound = startup::bind_all(&config).await?;
    for server in &bound {
        tracing::info!(address = %server.local_addr()?, "Listening for connections");
    }

    startup::serve(bound, async {
        signals::shutdown_signal().await;
    })
    .await?;
    Ok(())
}
