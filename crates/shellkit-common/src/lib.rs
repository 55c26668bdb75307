//! # ShellKit Common
//!
//! Configuration, error types, and logging setup shared by the ShellKit crates.
//!
//! ## Features
//!
//! - `ShellConfig`: site origin, cache version, asset manifest, offline fallbacks
//! - Logging configuration on top of `tracing-subscriber`

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{LogSettings, ShellConfig};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON for `ShellConfig`.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field has a value the controller cannot work with.
    #[error("Invalid config value for `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    /// The global subscriber was already set.
    #[error("Logging already initialized: {0}")]
    Logging(String),
}

impl ConfigError {
    /// Create an invalid-value error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
