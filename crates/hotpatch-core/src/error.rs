//! Unified error types for hotpatch

use thiserror::Error;

/// Unified error type for all hotpatch operations
#[derive(Error, Debug)]
pub enum HotpatchError {
    // Instruction errors
    #[error("Malformed instruction: {0}")]
    Parse(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Operator not authorized: {0}")]
    Unauthorized(String),

    // Code host errors
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Credentials rejected: {0}")]
    Auth(String),

    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Blob store error: {0}")]
    Store(String),

    // Model errors
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("API limit: {0}")]
    ApiLimit(String),

    // Deploy errors
    #[error("Deploy trigger error: {0}")]
    Deploy(String),

    // Local state errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl HotpatchError {
    /// Whether this error means the write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result type alias using HotpatchError
pub type Result<T> = std::result::Result<T, HotpatchError>;
