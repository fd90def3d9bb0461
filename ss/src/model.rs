//! Record types persisted by the coordination store
//!
//! Every timestamp is Unix milliseconds. Status enums round-trip through
//! their snake_case text form, which is also what lands in the database.

use serde::{Deserialize, Serialize};

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new time-sortable run id
pub fn new_run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Generate a new worker id
pub fn new_worker_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// 64-bit content hash as fixed-width hex (change detection, not crypto)
pub fn content_hash(data: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

impl RunStatus {
    /// A run in a terminal state accepts no more work
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Starting,
    Idle,
    Busy,
    Stale,
    Dead,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Stale => write!(f, "stale"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "stale" => Ok(Self::Stale),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// How the run's task set was sourced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Plan,
    Prompt,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Prompt => write!(f, "prompt"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "prompt" => Ok(Self::Prompt),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// One orchestrator invocation against a plan or prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Time-sortable identifier
    pub run_id: String,

    /// Name of the project being built (also the extract directory name)
    pub project_name: String,

    pub status: RunStatus,

    /// Plan file or free-text prompt
    pub source_kind: SourceKind,

    /// Plan path when source_kind is Plan
    pub source_path: Option<String>,

    /// Hash of the plan/prompt content; identifies the run family for resume
    pub source_hash: String,

    /// Configured worker count
    pub worker_count: i64,

    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,

    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// One unit of agent work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the store; ascending in creation order
    pub task_id: i64,

    pub run_id: String,

    /// Instruction handed to the agent
    pub text: String,

    /// Hash of `text`, used for resume matching
    pub content_hash: String,

    pub status: TaskStatus,

    /// Worker currently executing this task; non-null iff in_progress
    pub assigned_worker: Option<String>,

    /// Lower runs earlier; equal priorities may run concurrently
    pub priority: i64,

    /// Glob patterns the analyzer predicts this task will touch
    pub predicted_files: Vec<String>,

    /// Files actually modified, recorded after execution
    pub actual_files: Vec<String>,

    /// 1-based line in the source plan, when plan-sourced
    pub plan_line: Option<i64>,

    /// Failures and reassignments so far
    pub attempt_count: i64,

    pub last_error: Option<String>,

    /// Commit id that satisfied the resume-by-commit check
    pub skipped_commit: Option<String>,

    /// Commit created by the worker on completion
    pub commit_id: Option<String>,

    /// Token totals summed over the agent's step stream
    pub tokens_in: i64,
    pub tokens_out: i64,

    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// One long-running task executor bound to an isolated checkout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,

    pub run_id: String,

    /// Short ordinal, 1..=N within the run
    pub worker_num: i64,

    /// OS process id of the hosting process
    pub pid: i64,

    /// Pid of the currently running agent subprocess, if any
    pub agent_pid: Option<i64>,

    /// Branch the worker commits to
    pub branch: String,

    pub status: WorkerStatus,

    /// Non-null iff status is busy
    pub current_task_id: Option<i64>,

    /// Root of the worker's isolated checkout
    pub work_dir: String,

    pub started_at: i64,
    pub last_heartbeat_at: i64,
}

/// An advisory lock over a glob pattern, held for the duration of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub run_id: String,
    pub pattern: String,
    pub worker_id: String,
    pub task_id: i64,
    pub acquired_at: i64,
}

/// Per-status task counts for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl RunStats {
    /// All tasks have reached a terminal status
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in ["pending", "in_progress", "completed", "failed", "skipped"] {
            let parsed: TaskStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
        for status in ["running", "completed", "failed", "stopped"] {
            let parsed: RunStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
        for status in ["starting", "idle", "busy", "stale", "dead"] {
            let parsed: WorkerStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert!("bogus".parse::<RunStatus>().is_err());
        assert!("bogus".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn test_run_ids_sort_by_creation() {
        let a = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_run_id();
        assert!(a < b);
    }

    #[test]
    fn test_content_hash_stable() {
        let a = content_hash("implement the parser");
        let b = content_hash("implement the parser");
        let c = content_hash("implement the lexer");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_stats_all_terminal() {
        let stats = RunStats {
            total: 3,
            completed: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(stats.all_terminal());

        let stats = RunStats {
            total: 3,
            completed: 2,
            in_progress: 1,
            ..Default::default()
        };
        assert!(!stats.all_terminal());
    }
}
