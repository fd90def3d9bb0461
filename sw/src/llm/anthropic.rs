//! Anthropic Claude API client
//!
//! Minimal Messages API client: single-turn, text-only completions.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
use crate::config::LlmConfig;

/// Anthropic Claude API client
pub struct AnthropicClient {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
}

impl AnthropicClient {
    /// Create a new client from configuration.
    ///
    /// Reads the API key from the environment variable named in config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key =
            std::env::var(&config.api_key_env).map_err(|_| LlmError::MissingApiKey(config.api_key_env.clone()))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(LlmError::Network)?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
        })
    }

    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system_prompt,
            "messages": [{ "role": "user", "content": request.prompt }],
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response
                .json::<ApiError>()
                .await
                .map(|err| err.error.message)
                .unwrap_or_else(|_| "unreadable error body".to_string());
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            content,
            usage: TokenUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_body_caps_tokens() {
        let config = LlmConfig {
            max_tokens: 1000,
            ..Default::default()
        };
        let client = AnthropicClient {
            model: config.model.clone(),
            api_key: "test-key".into(),
            base_url: config.base_url.clone(),
            http: Client::new(),
            max_tokens: config.max_tokens,
        };

        let body = client.build_request_body(&CompletionRequest {
            system_prompt: "sys".into(),
            prompt: "user".into(),
            max_tokens: 99_999,
        });

        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["content"], "user");
    }

    #[test]
    fn test_api_response_parses() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "hello "},
                {"type": "text", "text": "world"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let parsed: ApiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.usage.input_tokens, 10);
    }

    #[test]
    fn test_missing_api_key() {
        let config = LlmConfig {
            api_key_env: "RALPHSWARM_TEST_KEY_THAT_DOES_NOT_EXIST".into(),
            ..Default::default()
        };
        assert!(matches!(
            AnthropicClient::from_config(&config),
            Err(LlmError::MissingApiKey(_))
        ));
    }
}
