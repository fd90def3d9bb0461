//! Request/response types for LLM completions

use serde::{Deserialize, Serialize};

/// A single completion request. Every call is independent: the analyzer
/// never carries conversation state between calls.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt
    pub system_prompt: String,

    /// User content
    pub prompt: String,

    /// Maximum tokens in the response
    pub max_tokens: u32,
}

/// A completion response
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Concatenated text content
    pub content: String,

    /// Token usage reported by the provider
    pub usage: TokenUsage,
}

/// Token usage for a single request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_default_is_zero() {
        let usage = TokenUsage::default();
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
    }
}
