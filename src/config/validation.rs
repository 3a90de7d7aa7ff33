//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sizes > 0)
//! - Detect conflicting listeners
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: WebhostConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::WebhostConfig;

/// One semantic problem, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

pub fn validate_config(config: &WebhostConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut positive = |field: &'static str, value: u64| {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    };

    positive("timeouts.request_secs", config.timeouts.request_secs);
    positive("timeouts.content_secs", config.timeouts.content_secs);
    positive("listener.max_connections", config.listener.max_connections as u64);
    positive(
        "limits.max_request_streambuf_size",
        config.limits.max_request_streambuf_size as u64,
    );
    positive("runtime.thread_pool_size", config.runtime.thread_pool_size as u64);
    positive("files.chunk_size", config.files.chunk_size as u64);

    if !config.listener.address.is_empty() && config.listener.address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.address",
            format!("is not an IP address: {:?}", config.listener.address),
        ));
    }

    match &config.tls {
        Some(tls) => {
            if tls.cert_path.trim().is_empty() {
                errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
            }
            if tls.key_path.trim().is_empty() {
                errors.push(ValidationError::new("tls.key_path", "must not be empty"));
            }
            if matches!(&tls.verify_path, Some(path) if path.trim().is_empty()) {
                errors.push(ValidationError::new("tls.verify_path", "must not be empty when set"));
            }
            if config.listener.enabled && tls.port == config.listener.port {
                errors.push(ValidationError::new(
                    "tls.port",
                    format!("conflicts with listener.port {}", config.listener.port),
                ));
            }
        }
        None if !config.listener.enabled => {
            errors.push(ValidationError::new(
                "listener.enabled",
                "is false and no [tls] section is configured",
            ));
        }
        None => {}
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("is not a socket address: {:?}", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
