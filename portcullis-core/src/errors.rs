use std::io;

use thiserror::Error;

/// Result type used across the portcullis crates.
pub type Result<T> = std::result::Result<T, PortcullisError>;

/// Canonical error representation shared by the gateway crates.
#[derive(Debug, Error)]
pub enum PortcullisError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable missing: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for environment variable {key}: {source}")]
    InvalidEnvVar {
        key: &'static str,
        #[source]
        source: std::env::VarError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for PortcullisError {
    fn from(value: ConfigError) -> Self {
        PortcullisError::Config(value.to_string())
    }
}
