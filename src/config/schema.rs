//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::server::{ServerSettings, DEFAULT_MAX_REQUEST_STREAMBUF_SIZE};
use crate::http::streaming::DEFAULT_CHUNK_SIZE;
use crate::net::listener::BindOptions;

/// Root configuration for the web host.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WebhostConfig {
    /// Plain HTTP listener.
    pub listener: ListenerConfig,

    /// Optional encrypted listener.
    pub tls: Option<TlsConfig>,

    pub timeouts: TimeoutConfig,

    pub limits: LimitsConfig,

    pub runtime: RuntimeConfig,

    /// Static file serving.
    pub files: FilesConfig,

    pub observability: ObservabilityConfig,
}

impl WebhostConfig {
    /// Settings for the plain listener.
    pub fn plain_settings(&self) -> ServerSettings {
        self.settings_for(self.listener.port)
    }

    /// Settings for the TLS listener, if one is configured.
    pub fn tls_settings(&self) -> Option<ServerSettings> {
        self.tls.as_ref().map(|tls| self.settings_for(tls.port))
    }

    fn settings_for(&self, port: u16) -> ServerSettings {
        ServerSettings {
            bind: BindOptions {
                address: self.listener.address.clone(),
                port,
                max_connections: self.listener.max_connections,
                reuse_address: self.listener.reuse_address,
            },
            timeout_request: Duration::from_secs(self.timeouts.request_secs),
            timeout_content: Duration::from_secs(self.timeouts.content_secs),
            max_request_streambuf_size: self.limits.max_request_streambuf_size,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Serve plain HTTP at all.
    pub enabled: bool,

    /// Interface to bind; empty means every IPv4 interface.
    pub address: String,

    pub port: u16,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Set `SO_REUSEADDR` before binding.
    pub reuse_address: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10_000,
            reuse_address: true,
        }
    }
}

/// TLS configuration for the encrypted listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default = "default_tls_port")]
    pub port: u16,

    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// CA bundle (PEM) used to verify client certificates. Setting it
    /// makes a client certificate mandatory.
    #[serde(default)]
    pub verify_path: Option<String>,
}

fn default_tls_port() -> u16 {
    443
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for a TLS handshake and for reading each request, in seconds.
    pub request_secs: u64,

    /// Deadline for each response write, in seconds.
    pub content_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 5,
            content_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upper bound on request head plus body, in bytes.
    pub max_request_streambuf_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_streambuf_size: DEFAULT_MAX_REQUEST_STREAMBUF_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads shared by all listeners.
    pub thread_pool_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Directory served by the static file handler.
    pub web_root: String,

    /// Streaming chunk capacity in bytes.
    pub chunk_size: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            web_root: "web".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    pub log_filter: String,

    /// Emit JSON lines instead of human-readable output.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "webhost=info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
