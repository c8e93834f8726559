// src/error.rs
// Standardized error types for mnemo

use thiserror::Error;

/// Main error type for the mnemo library
#[derive(Error, Debug)]
pub enum MnemoError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("embedding provider error: {0}")]
    Provider(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience type alias for Result using MnemoError
pub type Result<T> = std::result::Result<T, MnemoError>;

impl MnemoError {
    /// Stable machine-readable kind, carried in tool responses instead of
    /// stack traces.
    pub fn kind(&self) -> &'static str {
        match self {
            MnemoError::Config(_) => "config",
            MnemoError::Io(_) => "io",
            MnemoError::Storage(_) => "storage",
            MnemoError::Parse(_) => "parse",
            MnemoError::Provider(_) => "provider",
            MnemoError::Conflict(_) => "conflict",
            MnemoError::NotFound(_) => "not_found",
            MnemoError::Validation(_) => "validation",
            MnemoError::Cancelled => "cancelled",
            MnemoError::Json(_) => "parse",
            MnemoError::Http(_) => "provider",
            MnemoError::Other(_) => "other",
        }
    }

    /// Convert to a short user-facing string for tool boundaries.
    pub fn to_user_string(&self) -> String {
        format!("{} ({})", self, self.kind())
    }
}

impl From<String> for MnemoError {
    fn from(s: String) -> Self {
        MnemoError::Other(anyhow::anyhow!(s))
    }
}

impl From<tokio::task::JoinError> for MnemoError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MnemoError::Cancelled
        } else {
            MnemoError::Other(anyhow::anyhow!(err.to_string()))
        }
    }
}

impl From<MnemoError> for String {
    fn from(err: MnemoError) -> Self {
        err.to_user_string()
    }
}
