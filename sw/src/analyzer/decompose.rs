//! LLM-driven decomposition of a free-text prompt into parallelizable tasks

use std::sync::Arc;

use eyre::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::llm::{CompletionRequest, LlmClient};

/// One task produced by decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposedTask {
    /// Instruction for the agent
    pub task: String,

    /// Lower runs earlier; equal priorities may run concurrently
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Globs the model expects this task to touch
    #[serde(default)]
    pub estimated_files: Vec<String>,
}

fn default_priority() -> i64 {
    1
}

const DECOMPOSE_SYSTEM_PROMPT: &str = r#"You are a software architect decomposing a development request into discrete coding tasks for autonomous agents working in parallel.

Rules:
- Each task must be independently executable by one agent in one sitting
- Tasks with the same priority run concurrently; use a higher priority number for work that depends on earlier tasks
- estimated_files lists glob patterns of files the task will likely create or modify
- Create 2-8 tasks for a typical request

Respond with ONLY a JSON array, no prose:
[{"task": "...", "priority": 1, "estimated_files": ["src/*.rs"]}, ...]
"#;

/// Ask the LLM to break a prompt into an ordered task list
pub async fn decompose_prompt(llm: &Arc<dyn LlmClient>, prompt: &str) -> Result<Vec<DecomposedTask>> {
    debug!(prompt_len = prompt.len(), "decompose_prompt: called");

    let request = CompletionRequest {
        system_prompt: DECOMPOSE_SYSTEM_PROMPT.to_string(),
        prompt: prompt.to_string(),
        max_tokens: 4096,
    };
    let response = llm.complete(request).await?;

    let tasks = parse_task_array(&response.content)?;
    if tasks.is_empty() {
        bail!("Decomposition produced zero tasks");
    }

    info!(task_count = tasks.len(), "Decomposed prompt into tasks");
    Ok(tasks)
}

/// Parse the first JSON array found in a possibly chatty response
fn parse_task_array(content: &str) -> Result<Vec<DecomposedTask>> {
    let candidate = extract_json_array(content).unwrap_or(content);
    serde_json::from_str(candidate).map_err(|e| eyre::eyre!("LLM did not produce a valid task list: {e}"))
}

/// The outermost `[...]` span in the text, if any
pub(crate) fn extract_json_array(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    (end > start).then(|| &content[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;

    #[tokio::test]
    async fn test_decompose_parses_clean_json() {
        let response = r#"[
            {"task": "Set up the project", "priority": 1, "estimated_files": ["Cargo.toml", "src/*.rs"]},
            {"task": "Add tests", "priority": 2}
        ]"#;
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![response.to_string()]));

        let tasks = decompose_prompt(&llm, "build a calculator").await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].priority, 1);
        assert_eq!(tasks[0].estimated_files, vec!["Cargo.toml", "src/*.rs"]);
        // Missing fields fall back to defaults
        assert_eq!(tasks[1].priority, 2);
        assert!(tasks[1].estimated_files.is_empty());
    }

    #[tokio::test]
    async fn test_decompose_tolerates_surrounding_prose() {
        let response = "Here is the breakdown:\n[{\"task\": \"Do the thing\"}]\nGood luck!";
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![response.to_string()]));

        let tasks = decompose_prompt(&llm, "do a thing").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task, "Do the thing");
        assert_eq!(tasks[0].priority, 1);
    }

    #[tokio::test]
    async fn test_decompose_rejects_garbage() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec!["I cannot help with that.".to_string()]));
        assert!(decompose_prompt(&llm, "do a thing").await.is_err());
    }

    #[tokio::test]
    async fn test_decompose_rejects_empty_list() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec!["[]".to_string()]));
        assert!(decompose_prompt(&llm, "do a thing").await.is_err());
    }

    #[test]
    fn test_extract_json_array() {
        assert_eq!(extract_json_array("noise [1, 2] more"), Some("[1, 2]"));
        assert_eq!(extract_json_array("no array here"), None);
        assert_eq!(extract_json_array("] reversed ["), None);
    }
}
