//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError};

/// Stateless LLM client - each call is independent (fresh context)
///
/// The analyzer asks one-shot questions (decompose this prompt, predict
/// files for this task); no conversation state is kept between calls.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single completion request (blocking until complete)
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::llm::TokenUsage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock LLM client for unit tests: replays canned responses in order
    pub struct MockLlmClient {
        responses: Vec<String>,
        call_count: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses,
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(idx)
                .map(|content| CompletionResponse {
                    content: content.clone(),
                    usage: TokenUsage::default(),
                })
                .ok_or_else(|| LlmError::InvalidResponse("No more mock responses".to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_client_returns_responses_in_order() {
            let client = MockLlmClient::new(vec!["first".into(), "second".into()]);
            let request = CompletionRequest {
                system_prompt: "test".into(),
                prompt: "go".into(),
                max_tokens: 100,
            };

            assert_eq!(client.complete(request.clone()).await.unwrap().content, "first");
            assert_eq!(client.complete(request).await.unwrap().content, "second");
            assert_eq!(client.call_count(), 2);
        }

        #[tokio::test]
        async fn test_mock_client_errors_when_exhausted() {
            let client = MockLlmClient::new(vec![]);
            let request = CompletionRequest {
                system_prompt: "test".into(),
                prompt: "go".into(),
                max_tokens: 100,
            };
            assert!(client.complete(request).await.is_err());
        }
    }
}
