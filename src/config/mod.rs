//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → WebhostConfig (validated, immutable)
//!     → ServerSettings per listener
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    FilesConfig, LimitsConfig, ListenerConfig, ObservabilityConfig, RuntimeConfig, TimeoutConfig,
    TlsConfig, WebhostConfig,
};
pub use validation::{validate_config, ValidationError};
