//! LLM client module
//!
//! One-shot completions used by the task analyzer for prompt decomposition
//! and file prediction. The coding agent itself is a separate black-box CLI,
//! not this client.

use std::sync::Arc;

mod anthropic;
pub mod client;
mod error;
mod types;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use error::LlmError;
pub use types::{CompletionRequest, CompletionResponse, TokenUsage};

use crate::config::LlmConfig;

/// Create an LLM client for the provider named in config
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        other => Err(LlmError::InvalidResponse(format!(
            "Unknown LLM provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client_unknown_provider() {
        let config = LlmConfig {
            provider: "carrier-pigeon".into(),
            ..Default::default()
        };
        assert!(create_client(&config).is_err());
    }
}
