//! The worker loop
//!
//! A worker is not an object hierarchy, just this loop parameterized by a
//! context struct: poll the store for an assignment, skip work that already
//! exists as a commit, drive the agent, commit, report. All shared behavior
//! is free functions over the store and the worktree manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use swarmstore::{Task, WorkerStatus};

use super::agent::{AgentError, AgentExecution, AgentInvocation, task_log_path};
use super::heartbeat::spawn_heartbeat;
use crate::SharedStore;
use crate::analyzer::keyword_digest;
use crate::worktree::WorktreeManager;

/// Everything a worker needs; there is no other worker state
#[derive(Clone)]
pub struct WorkerContext {
    pub store: SharedStore,
    pub manager: Arc<WorktreeManager>,
    pub run_id: String,
    pub worker_id: String,
    pub worker_num: i64,
    pub checkout: PathBuf,
    pub logs_dir: PathBuf,
    pub invocation: AgentInvocation,
    pub heartbeat_period: Duration,
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub max_attempts: i64,
    pub prompt_byte_cap: usize,
    pub stop: watch::Receiver<bool>,
}

/// Assemble the prompt handed to the agent
pub fn build_agent_prompt(task_text: &str, promise: &str) -> String {
    format!(
        "{task_text}\n\n\
         Work only inside the current directory. \
         When the task is fully complete, output exactly: {promise}\n"
    )
}

/// Run one worker until its run reaches a terminal state
pub async fn run_worker(ctx: WorkerContext) -> Result<()> {
    info!(run_id = %ctx.run_id, worker_num = ctx.worker_num, "Worker starting");

    ctx.store
        .lock()
        .await
        .set_worker_status(&ctx.worker_id, WorkerStatus::Idle, None)?;

    let heartbeat = spawn_heartbeat(ctx.store.clone(), ctx.worker_id.clone(), ctx.heartbeat_period);

    loop {
        if *ctx.stop.borrow() {
            debug!(worker_num = ctx.worker_num, "Worker observed stop signal");
            break;
        }

        let run_terminal = {
            let store = ctx.store.lock().await;
            store.get_run(&ctx.run_id)?.status.is_terminal()
        };
        if run_terminal {
            debug!(worker_num = ctx.worker_num, "Run is terminal, worker exiting");
            break;
        }

        let assignment = { ctx.store.lock().await.assigned_task(&ctx.worker_id)? };
        let Some(task) = assignment else {
            let mut stop = ctx.stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(ctx.poll_interval) => {}
                _ = crate::stop_signalled(&mut stop) => {}
            }
            continue;
        };

        // A failed task must not kill the worker; the store records the
        // failure and the loop moves on
        if let Err(e) = execute_task(&ctx, &task).await {
            warn!(task_id = task.task_id, error = %e, "Task execution errored");
            let result = ctx
                .store
                .lock()
                .await
                .fail_task(task.task_id, &e.to_string(), false, ctx.max_attempts);
            if let Err(store_err) = result {
                warn!(task_id = task.task_id, error = %store_err, "Could not record task failure");
            }
        }
    }

    heartbeat.stop().await;
    info!(run_id = %ctx.run_id, worker_num = ctx.worker_num, "Worker exited");
    Ok(())
}

/// Execute one assigned task end to end
async fn execute_task(ctx: &WorkerContext, task: &Task) -> Result<()> {
    info!(task_id = task.task_id, worker_num = ctx.worker_num, "Executing task");
    let digest = keyword_digest(&task.text);

    // Resume-by-commit: a commit subject carrying the task digest means a
    // previous run already did this work
    if !digest.is_empty() {
        let subjects = ctx.manager.log_subjects(&ctx.checkout).await?;
        if let Some((commit, subject)) = subjects.iter().find(|(_, subject)| subject.contains(&digest)) {
            info!(task_id = task.task_id, %commit, %subject, "Skipping task, commit already exists");
            ctx.store.lock().await.skip_task(task.task_id, commit)?;
            return Ok(());
        }
    }

    let prompt = build_agent_prompt(&task.text, &ctx.invocation.promise);
    if prompt.len() > ctx.prompt_byte_cap {
        let message = format!(
            "task prompt is {} bytes, exceeding the {}-byte cap",
            prompt.len(),
            ctx.prompt_byte_cap
        );
        warn!(task_id = task.task_id, "{message}");
        ctx.store
            .lock()
            .await
            .fail_task(task.task_id, &message, false, ctx.max_attempts)?;
        return Ok(());
    }

    let log_path = task_log_path(&ctx.logs_dir, task.task_id, task.attempt_count);
    let exec = match AgentExecution::spawn(&ctx.invocation, &prompt, &ctx.checkout, &log_path).await {
        Ok(exec) => exec,
        Err(e @ AgentError::SpawnFailed { .. }) => {
            // A missing agent binary will not appear on retry
            ctx.store
                .lock()
                .await
                .fail_task(task.task_id, &e.to_string(), false, ctx.max_attempts)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(pid) = exec.pid() {
        ctx.store.lock().await.set_agent_pid(&ctx.worker_id, Some(pid as i64))?;
    }

    let mut stop = ctx.stop.clone();
    let outcome = tokio::select! {
        outcome = exec.wait(ctx.task_timeout) => Some(outcome?),
        _ = crate::stop_signalled(&mut stop) => None,
    };

    ctx.store.lock().await.set_agent_pid(&ctx.worker_id, None)?;

    let Some(outcome) = outcome else {
        // Stop signal arrived mid-task: the dropped execution killed the
        // agent; re-enqueue the work
        info!(task_id = task.task_id, "Stop signal interrupted task, re-enqueueing");
        ctx.store
            .lock()
            .await
            .fail_task(task.task_id, "interrupted by stop", true, ctx.max_attempts)?;
        return Ok(());
    };

    if outcome.is_success() {
        let message = format!("swarm task {}: {digest}", task.task_id);
        let commit = ctx.manager.commit(&ctx.checkout, &message).await?;
        let actual_files = match &commit {
            Some(commit) => ctx.manager.commit_files(&ctx.checkout, commit).await?,
            None => Vec::new(),
        };

        let mut store = ctx.store.lock().await;
        store.record_task_execution(
            task.task_id,
            commit.as_deref(),
            outcome.tokens_in as i64,
            outcome.tokens_out as i64,
        )?;
        store.complete_task(task.task_id, &actual_files)?;
        info!(task_id = task.task_id, ?commit, "Task completed");
        return Ok(());
    }

    // Timeouts, non-zero exits, and missing promises are all transient:
    // the attempt budget decides when they become terminal
    let error = if outcome.timed_out {
        format!("agent timed out after {}s", ctx.task_timeout.as_secs())
    } else if outcome.exit_code != 0 {
        format!("agent exited with code {}", outcome.exit_code)
    } else {
        "agent exited without emitting the completion promise".to_string()
    };

    warn!(task_id = task.task_id, %error, "Task attempt failed");
    let mut store = ctx.store.lock().await;
    store.record_task_execution(task.task_id, None, outcome.tokens_in as i64, outcome.tokens_out as i64)?;
    store.fail_task(task.task_id, &error, true, ctx.max_attempts)?;
    Ok(())
}
