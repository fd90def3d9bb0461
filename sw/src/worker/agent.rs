//! Agent CLI subprocess driver
//!
//! Spawns the black-box coding agent with the task prompt on stdin and the
//! worker checkout as working directory, streams its stdout/stderr to a
//! per-task log file, and watches the stream for token usage and the
//! completion sentinel. The per-task timeout kills the subprocess.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{AgentEvent, StreamTotals};

/// Error types for agent invocation
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to invoke the agent CLI
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Executable name or path
    pub command: String,

    /// Arguments
    pub args: Vec<String>,

    /// Extra environment (provider/model selectors)
    pub env: Vec<(String, String)>,

    /// Sentinel the agent must emit on success
    pub promise: String,
}

/// What a finished (or killed) agent run produced
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Exit code; -1 when the process died without one
    pub exit_code: i32,

    /// Whether the completion sentinel appeared anywhere in the output
    pub promise_seen: bool,

    /// Token totals summed over the whole step stream
    pub tokens_in: u64,
    pub tokens_out: u64,

    /// Whether the per-task timeout expired
    pub timed_out: bool,
}

impl AgentOutcome {
    /// Success means a zero exit AND the sentinel in the output
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.promise_seen && !self.timed_out
    }
}

/// A running agent subprocess
pub struct AgentExecution {
    child: Child,
    stdout_task: JoinHandle<StreamTotals>,
    stderr_task: JoinHandle<()>,
}

impl AgentExecution {
    /// Spawn the agent with the prompt on stdin
    pub async fn spawn(
        invocation: &AgentInvocation,
        prompt: &str,
        cwd: &Path,
        log_path: &Path,
    ) -> Result<Self, AgentError> {
        debug!(command = %invocation.command, cwd = %cwd.display(), "AgentExecution::spawn: called");

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut child = Command::new(&invocation.command)
            .args(&invocation.args)
            .envs(invocation.env.iter().cloned())
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                command: invocation.command.clone(),
                source,
            })?;

        // Feed the prompt from a task so a slow-reading agent cannot
        // deadlock the spawn on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %e, "Failed to write prompt to agent stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Io(std::io::Error::other("agent stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            AgentError::Io(std::io::Error::other("agent stderr not captured"))
        })?;

        let stdout_log = open_log(log_path).await?;
        let stdout_promise = invocation.promise.clone();
        let stdout_task = tokio::spawn(async move {
            let mut log = stdout_log;
            let mut totals = StreamTotals::default();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                totals.observe(&AgentEvent::parse(&line), &stdout_promise);
                let _ = log.write_all(line.as_bytes()).await;
                let _ = log.write_all(b"\n").await;
            }
            let _ = log.flush().await;
            totals
        });

        let stderr_log = open_log(log_path).await?;
        let stderr_task = tokio::spawn(async move {
            let mut log = stderr_log;
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = log.write_all(b"[stderr] ").await;
                let _ = log.write_all(line.as_bytes()).await;
                let _ = log.write_all(b"\n").await;
            }
            let _ = log.flush().await;
        });

        Ok(Self {
            child,
            stdout_task,
            stderr_task,
        })
    }

    /// OS pid of the agent subprocess
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the agent to exit, killing it at the timeout
    pub async fn wait(mut self, timeout: Duration) -> Result<AgentOutcome, AgentError> {
        debug!(timeout_secs = timeout.as_secs(), "AgentExecution::wait: called");

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(e)) => {
                warn!(error = %e, "Agent wait failed");
                return Err(AgentError::Io(e));
            }
            Err(_) => {
                warn!("Agent timed out, killing subprocess");
                let _ = self.child.kill().await;
                (-1, true)
            }
        };

        let totals = self.stdout_task.await.unwrap_or_default();
        let _ = self.stderr_task.await;

        info!(
            exit_code,
            timed_out,
            promise_seen = totals.promise_seen,
            tokens_in = totals.tokens_in,
            tokens_out = totals.tokens_out,
            "Agent finished"
        );

        Ok(AgentOutcome {
            exit_code,
            promise_seen: totals.promise_seen,
            tokens_in: totals.tokens_in,
            tokens_out: totals.tokens_out,
            timed_out,
        })
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new().create(true).append(true).open(path).await
}

/// The log file for one task execution attempt
pub fn task_log_path(logs_dir: &Path, task_id: i64, attempt: i64) -> PathBuf {
    logs_dir.join(format!("task-{task_id}-attempt-{attempt}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> AgentInvocation {
        AgentInvocation {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![],
            promise: "<promise>COMPLETE</promise>".to_string(),
        }
    }

    #[tokio::test]
    async fn test_agent_success_with_promise() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("logs/task-1.log");

        let invocation = sh("cat >/dev/null; echo '{\"type\": \"step_finish\", \"tokens_in\": 5, \"tokens_out\": 2}'; echo 'done <promise>COMPLETE</promise>'");
        let exec = AgentExecution::spawn(&invocation, "do the work", dir.path(), &log)
            .await
            .unwrap();
        assert!(exec.pid().is_some());

        let outcome = exec.wait(Duration::from_secs(10)).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.tokens_in, 5);
        assert_eq!(outcome.tokens_out, 2);

        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("step_finish"));
        assert!(logged.contains("COMPLETE"));
    }

    #[tokio::test]
    async fn test_agent_exit_zero_without_promise_is_not_success() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("task.log");

        let invocation = sh("cat >/dev/null; echo 'did some things, never promised'");
        let exec = AgentExecution::spawn(&invocation, "work", dir.path(), &log).await.unwrap();
        let outcome = exec.wait(Duration::from_secs(10)).await.unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.promise_seen);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_agent_nonzero_exit_is_not_success() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("task.log");

        let invocation = sh("cat >/dev/null; echo '<promise>COMPLETE</promise>'; exit 3");
        let exec = AgentExecution::spawn(&invocation, "work", dir.path(), &log).await.unwrap();
        let outcome = exec.wait(Duration::from_secs(10)).await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.promise_seen);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_agent_timeout_kills_subprocess() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("task.log");

        let invocation = sh("cat >/dev/null; sleep 30");
        let exec = AgentExecution::spawn(&invocation, "work", dir.path(), &log).await.unwrap();
        let started = std::time::Instant::now();
        let outcome = exec.wait(Duration::from_millis(200)).await.unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.is_success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_agent_reads_prompt_from_stdin() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("task.log");

        // Echo the prompt back; it must appear in the log
        let invocation = sh("cat");
        let exec = AgentExecution::spawn(&invocation, "the exact prompt text", dir.path(), &log)
            .await
            .unwrap();
        exec.wait(Duration::from_secs(10)).await.unwrap();

        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("the exact prompt text"));
    }

    #[tokio::test]
    async fn test_agent_spawn_failure() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("task.log");

        let invocation = AgentInvocation {
            command: "/nonexistent/agent-binary".to_string(),
            args: vec![],
            env: vec![],
            promise: "<promise>COMPLETE</promise>".to_string(),
        };
        let result = AgentExecution::spawn(&invocation, "work", dir.path(), &log).await;
        assert!(matches!(result, Err(AgentError::SpawnFailed { .. })));
    }

    #[test]
    fn test_task_log_path_layout() {
        let path = task_log_path(Path::new("/state/run/worker-1/logs"), 7, 2);
        assert_eq!(path, PathBuf::from("/state/run/worker-1/logs/task-7-attempt-2.log"));
    }
}
