//! LLM error types

use std::time::Duration;

/// Error types for LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing API key: environment variable {0} not set")]
    MissingApiKey(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::InvalidResponse(_) | Self::MissingApiKey(_) => false,
        }
    }
}
