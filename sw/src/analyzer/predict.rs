//! Per-task file-impact prediction
//!
//! For each task the LLM sees the task text plus a truncated listing of the
//! current source tree and answers with a JSON array of glob patterns. The
//! scheduler treats those globs as locks, so predictions are advisory but
//! safety-relevant: an unparseable answer degrades to an empty set, which
//! locks nothing.
//!
//! Predictions are cached on disk keyed by task content hash + tree digest,
//! so resuming a run does not repeat LLM calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use swarmstore::content_hash;

use super::decompose::extract_json_array;
use crate::llm::{CompletionRequest, LlmClient};

/// Listing bounds keep the prediction prompt comfortably under model limits
const MAX_TREE_ENTRIES: usize = 400;
const MAX_TREE_BYTES: usize = 16 * 1024;

const PREDICT_SYSTEM_PROMPT: &str = r#"You predict which files a coding task will create or modify.

Given a task description and the current source tree, respond with ONLY a JSON array of glob patterns, no prose. Prefer narrow patterns ("src/api/*.rs") over broad ones. Use "**" only when the task genuinely touches the whole tree.

Example response: ["src/parser.rs", "tests/parser_*.rs"]
"#;

/// A bounded textual listing of the source tree, one path per line.
/// `.git` and other dot-directories are skipped.
pub fn tree_listing(root: &Path) -> String {
    let mut listing = String::new();
    let mut entries = 0usize;

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let line = relative.to_string_lossy();
        if entries >= MAX_TREE_ENTRIES || listing.len() + line.len() + 1 > MAX_TREE_BYTES {
            listing.push_str("…\n");
            break;
        }
        listing.push_str(&line);
        listing.push('\n');
        entries += 1;
    }

    listing
}

/// Digest of a tree listing, part of the prediction cache key
pub fn tree_digest(listing: &str) -> String {
    content_hash(listing)
}

/// Predict the glob set for one task. Failures and unparseable answers
/// degrade to an empty prediction rather than an error.
pub async fn predict_files(llm: &Arc<dyn LlmClient>, task_text: &str, listing: &str) -> Vec<String> {
    debug!(task_len = task_text.len(), "predict_files: called");

    let request = CompletionRequest {
        system_prompt: PREDICT_SYSTEM_PROMPT.to_string(),
        prompt: format!("Task:\n{task_text}\n\nSource tree:\n{listing}"),
        max_tokens: 1024,
    };

    let response = match llm.complete(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "File prediction call failed, recording empty set");
            return Vec::new();
        }
    };

    parse_pattern_array(&response.content)
}

/// Parse a JSON array of strings, dropping syntactically invalid globs.
/// Anything else parses to the empty set.
fn parse_pattern_array(content: &str) -> Vec<String> {
    let candidate = extract_json_array(content).unwrap_or(content);
    let Ok(patterns) = serde_json::from_str::<Vec<String>>(candidate) else {
        debug!("parse_pattern_array: response is not a JSON array of strings");
        return Vec::new();
    };

    patterns
        .into_iter()
        .filter(|pattern| {
            let ok = glob::Pattern::new(pattern).is_ok();
            if !ok {
                warn!(%pattern, "Dropping syntactically invalid glob from prediction");
            }
            ok
        })
        .collect()
}

/// On-disk prediction cache, keyed by task content hash + tree digest
pub struct PredictionCache {
    path: PathBuf,
    entries: HashMap<String, Vec<String>>,
    dirty: bool,
}

impl PredictionCache {
    /// Load the cache file, or start empty when absent or unreadable
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    fn key(task_text: &str, tree_digest: &str) -> String {
        format!("{}:{}", content_hash(task_text), tree_digest)
    }

    pub fn get(&self, task_text: &str, tree_digest: &str) -> Option<&Vec<String>> {
        self.entries.get(&Self::key(task_text, tree_digest))
    }

    pub fn insert(&mut self, task_text: &str, tree_digest: &str, patterns: Vec<String>) {
        self.entries.insert(Self::key(task_text, tree_digest), patterns);
        self.dirty = true;
    }

    /// Persist the cache when it changed
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content).context("Failed to write prediction cache")?;
        self.dirty = false;
        info!(path = %self.path.display(), entries = self.entries.len(), "Saved prediction cache");
        Ok(())
    }
}

/// Predict with cache lookup: hits skip the LLM entirely
pub async fn predict_files_cached(
    llm: &Arc<dyn LlmClient>,
    cache: &mut PredictionCache,
    task_text: &str,
    listing: &str,
) -> Vec<String> {
    let digest = tree_digest(listing);
    if let Some(patterns) = cache.get(task_text, &digest) {
        debug!("predict_files_cached: cache hit");
        return patterns.clone();
    }
    let patterns = predict_files(llm, task_text, listing).await;
    cache.insert(task_text, &digest, patterns.clone());
    patterns
}
