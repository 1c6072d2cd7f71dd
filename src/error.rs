//! Error types for Vigil

use thiserror::Error;

/// Main error type for Vigil operations
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("{0} already exists")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Listener error: {0}")]
    ListenerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    RegexError(#[from] regex::Error),
}

impl VigilError {
    /// HTTP status the management API answers with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            VigilError::Unauthorized(_) => 401,
            VigilError::Forbidden(_) => 403,
            VigilError::NotFound(_) => 404,
            VigilError::Conflict(_) => 409,
            VigilError::MalformedInput(_)
            | VigilError::RegexError(_)
            | VigilError::JsonError(_) => 400,
            VigilError::StorageUnavailable(_) => 503,
            _ => 500,
        }
    }
}

/// Result type alias for Vigil operations
pub type Result<T> = std::result::Result<T, VigilError>;
