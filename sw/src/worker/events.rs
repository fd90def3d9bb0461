//! Agent CLI output events
//!
//! The agent's stdout is a heterogeneous one-JSON-object-per-line stream.
//! Each line maps to a tagged variant; lines that are not JSON objects are
//! plain text. Token accounting sums over every StepFinish in the stream,
//! never just the first, and completion detection scans all textual output.

use serde_json::Value;

/// One parsed line of agent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The agent began a step
    StepStart,

    /// The agent invoked a tool
    ToolUse { name: Option<String> },

    /// A step finished, reporting token usage
    StepFinish { tokens_in: u64, tokens_out: u64 },

    /// Textual output (JSON text events and raw non-JSON lines alike)
    Text { text: String },

    /// A JSON object of an unrecognized type
    Other,
}

impl AgentEvent {
    /// Parse one stdout line
    pub fn parse(line: &str) -> AgentEvent {
        let trimmed = line.trim();
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) else {
            return AgentEvent::Text {
                text: line.to_string(),
            };
        };

        match obj.get("type").and_then(Value::as_str) {
            Some("step_start" | "message_start") => AgentEvent::StepStart,
            Some("tool_use") => AgentEvent::ToolUse {
                name: obj.get("name").and_then(Value::as_str).map(str::to_string),
            },
            Some("step_finish" | "result") => AgentEvent::StepFinish {
                tokens_in: token_count(&obj, &["tokens_in", "input_tokens"]),
                tokens_out: token_count(&obj, &["tokens_out", "output_tokens"]),
            },
            Some("text" | "assistant") => AgentEvent::Text {
                text: obj
                    .get("text")
                    .or_else(|| obj.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => AgentEvent::Other,
        }
    }

    /// Textual content of this event, for sentinel scanning
    pub fn textual(&self) -> Option<&str> {
        match self {
            AgentEvent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Read a token count from the object itself or its nested `usage` block,
/// accepting the key spellings agents actually emit
fn token_count(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> u64 {
    let usage = obj.get("usage").and_then(Value::as_object);
    for key in keys {
        if let Some(count) = obj.get(*key).and_then(Value::as_u64) {
            return count;
        }
        if let Some(count) = usage.and_then(|u| u.get(*key)).and_then(Value::as_u64) {
            return count;
        }
    }
    0
}

/// Running totals over a stream of agent events
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTotals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub promise_seen: bool,
}

impl StreamTotals {
    /// Fold one event into the totals
    pub fn observe(&mut self, event: &AgentEvent, promise: &str) {
        if let AgentEvent::StepFinish { tokens_in, tokens_out } = event {
            self.tokens_in += tokens_in;
            self.tokens_out += tokens_out;
        }
        if let Some(text) = event.textual()
            && text.contains(promise)
        {
            self.promise_seen = true;
        }
    }
}
