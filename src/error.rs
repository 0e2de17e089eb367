//! Error types for forge-core.

use thiserror::Error;

/// Result type alias using forge-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during generation and orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing required field, malformed JSON, unknown alias
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Non-2xx response from an LLM provider
    #[error("Provider error: {provider} - {message}")]
    Provider { provider: String, message: String },

    /// Provider returned no usable text
    #[error("Empty response from {provider}")]
    EmptyResponse { provider: String },

    /// Provider returned text that is not an HTML document
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    /// Mid-stream failure; partial output discarded
    #[error("Stream error: {0}")]
    Stream(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Disk full, permission denied, corrupt file
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Required key or subsystem absent
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Id absent from a store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Sliding-window rate limit exceeded
    #[error("Rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Bearer token mismatch
    #[error("Unauthorized")]
    Unauthorized,

    /// Every provider in a duel failed
    #[error("All providers failed")]
    AllProvidersFailed,

    /// Pipeline stage failure with the originating stage name
    #[error("[{stage}] {message}")]
    Stage { stage: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an empty-response error.
    pub fn empty_response(provider: impl Into<String>) -> Self {
        Self::EmptyResponse {
            provider: provider.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a persistence error from any I/O failure.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Create a stage error carrying the originating pipeline stage.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::RateLimited { retry_after_ms }
    }

    /// The pipeline stage this error originated from, if any.
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
