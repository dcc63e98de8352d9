use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single call to an embedding provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("model error: {0}")]
    Model(String),
}

impl ProviderError {
    /// Configuration problems never fix themselves between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::NotConfigured(_))
    }

    /// Wait requested by the provider before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("embedding provider '{provider}' failed after {attempts} attempt(s): {source}")]
    Provider {
        provider: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("vector index not found")]
    IndexNotFound,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("indexing already in progress")]
    IndexingInProgress,

    #[error("knowledge base error: {0}")]
    KnowledgeBase(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<qdrant_client::QdrantError> for Error {
    fn from(e: qdrant_client::QdrantError) -> Self {
        Error::VectorStore(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
