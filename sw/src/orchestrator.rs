//! Top-level run lifecycle
//!
//! Startup order is fixed: normalize the base repo, hash the source, create
//! (or resume) the run, analyze into tasks, spawn workers into isolated
//! checkouts, run the scheduler, then merge, extract, and write the plan
//! back. The orchestrator owns the only store handle and the stop signal;
//! workers and scheduler get clones.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result, bail};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use swarmstore::{NewRun, Run, RunStatus, SourceKind, Store, Task, TaskStatus, content_hash};

use crate::SharedStore;
use crate::analyzer::{self, PredictionCache, parse_plan, update_plan};
use crate::config::Config;
use crate::llm::{LlmClient, create_client};
use crate::scheduler::{SchedulerConfig, SchedulerOutcome, run_scheduler};
use crate::worker::{AgentInvocation, WorkerContext, run_worker};
use crate::worktree::{ConflictRecord, WorktreeConfig, WorktreeManager, extract, merge_worker_branches};

/// What the run executes
#[derive(Debug, Clone)]
pub enum RunSource {
    /// A devplan file
    Plan(PathBuf),

    /// A free-text prompt, decomposed by the LLM
    Prompt(String),

    /// A previous run, by id or unique prefix
    Resume(String),
}

/// CLI-level overrides applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub workers: Option<i64>,
    pub timeout_secs: Option<u64>,
}

/// Everything the final summary reports
#[derive(Debug)]
pub struct RunSummary {
    pub run: Run,
    pub tasks: Vec<Task>,
    pub conflicts: Vec<ConflictRecord>,
    pub extracted_to: Option<PathBuf>,
}

/// Execute a full swarm run. Returns the summary; orchestrator-level
/// failures (store, repo, checkouts) surface as errors.
pub async fn run_swarm(mut config: Config, source: RunSource, overrides: RunOverrides) -> Result<RunSummary> {
    if let Some(workers) = overrides.workers {
        config.swarm.workers = workers;
    }
    if let Some(timeout) = overrides.timeout_secs {
        config.swarm.task_timeout_secs = timeout;
    }

    let workers = config.swarm.workers;
    if workers < 1 {
        bail!("worker count must be at least 1");
    }
    if workers > config.swarm.max_workers_per_run {
        bail!(
            "{} workers requested, but max-workers-per-run is {}",
            workers,
            config.swarm.max_workers_per_run
        );
    }
    if workers > config.swarm.max_workers_global {
        bail!(
            "{} workers requested, but max-workers-global is {}",
            workers,
            config.swarm.max_workers_global
        );
    }

    let repo_root = std::env::current_dir().context("Cannot determine the source repository directory")?;
    let manager = Arc::new(WorktreeManager::new(WorktreeConfig {
        repo_root: repo_root.clone(),
        state_root: config.storage.state_root(),
        integration_branch: config.git.integration_branch.clone(),
        branch_prefix: config.git.branch_prefix.clone(),
    }));
    manager
        .prepare_base()
        .await
        .context("Source repository is unusable")?;

    let store = Store::open(config.storage.store_path()).context("Coordination store is unavailable")?;
    let store: SharedStore = Arc::new(Mutex::new(store));

    let (run, plan_path) = initialize_run(&store, &config, &source, &repo_root, workers).await?;
    let run_id = run.run_id.clone();
    info!(%run_id, project = %run.project_name, workers, "Run initialized");

    // Stop propagation: ctrl-c flips the same watch every component selects
    // on; `swarm stop` from another process flips the run status instead
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping run");
                let _ = stop_tx.send(true);
            }
        });
    }

    let mut worker_handles = Vec::new();
    for worker_num in 1..=workers {
        let checkout = manager
            .create(&run_id, worker_num)
            .await
            .context("Cannot create worker checkout")?;
        let logs_dir = config.storage.worker_logs_dir(&run_id, worker_num);
        std::fs::create_dir_all(&logs_dir)?;

        let worker_id = store.lock().await.register_worker(
            &run_id,
            worker_num,
            std::process::id() as i64,
            &checkout.branch,
            &checkout.path.display().to_string(),
        )?;

        let ctx = WorkerContext {
            store: store.clone(),
            manager: manager.clone(),
            run_id: run_id.clone(),
            worker_id,
            worker_num,
            checkout: checkout.path.clone(),
            logs_dir,
            invocation: agent_invocation(&config),
            heartbeat_period: config.swarm.heartbeat_period(),
            poll_interval: config.swarm.poll_interval(),
            task_timeout: config.swarm.task_timeout(),
            max_attempts: config.swarm.max_attempts,
            prompt_byte_cap: config.swarm.prompt_byte_cap,
            stop: stop_rx.clone(),
        };
        worker_handles.push(tokio::spawn(run_worker(ctx)));
    }

    let outcome = run_scheduler(
        store.clone(),
        &run_id,
        SchedulerConfig {
            poll_interval: config.swarm.poll_interval(),
            stale_threshold: config.swarm.stale_threshold(),
        },
        stop_rx.clone(),
    )
    .await?;

    // Scheduler is done; workers exit at their next boundary
    let _ = stop_tx.send(true);
    for result in futures::future::join_all(worker_handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Worker ended with error"),
            Err(e) => warn!(error = %e, "Worker task panicked"),
        }
    }

    let final_status = match &outcome {
        SchedulerOutcome::Completed(_) => RunStatus::Completed,
        SchedulerOutcome::Stopped(_) => RunStatus::Stopped,
    };
    let run = store.lock().await.finish_run(&run_id, final_status)?;

    let mut conflicts = Vec::new();
    let mut extracted_to = None;
    if final_status == RunStatus::Completed {
        let branches = worker_branches(&store, &run_id).await?;
        let merge_outcome = merge_worker_branches(&repo_root, &config.git.integration_branch, &branches).await?;
        conflicts = merge_outcome.conflicts;

        let destination = config.storage.projects_root().join(&run.project_name);
        extracted_to = Some(extract(&repo_root, &destination, &run_id).await?);

        if let Some(plan_path) = &plan_path {
            write_plan_back(&store, &run_id, plan_path).await?;
        }
    }

    let tasks = store.lock().await.list_tasks(&run_id)?;
    let summary = RunSummary {
        run,
        tasks,
        conflicts,
        extracted_to,
    };
    write_run_artifacts(&config, &run_id, &summary)?;
    Ok(summary)
}

/// Persist the machine-readable summary under the run's artifacts directory
fn write_run_artifacts(config: &Config, run_id: &str, summary: &RunSummary) -> Result<()> {
    let artifacts_dir = config.storage.run_dir(run_id).join("artifacts");
    std::fs::create_dir_all(&artifacts_dir)?;
    let value = serde_json::json!({
        "run": summary.run,
        "tasks": summary.tasks,
        "conflicts": summary.conflicts,
        "extracted_to": summary.extracted_to,
    });
    std::fs::write(artifacts_dir.join("summary.json"), serde_json::to_string_pretty(&value)?)
        .context("Cannot write run summary artifact")?;
    Ok(())
}

/// Create or resume the run record and populate its task set.
/// Returns the run plus the plan path when plan-sourced.
async fn initialize_run(
    store: &SharedStore,
    config: &Config,
    source: &RunSource,
    repo_root: &std::path::Path,
    workers: i64,
) -> Result<(Run, Option<PathBuf>)> {
    match source {
        RunSource::Plan(path) => {
            let content =
                std::fs::read_to_string(path).context(format!("Cannot read plan file {}", path.display()))?;
            let source_hash = content_hash(&content);

            // A prior run with the same source hash means this invocation
            // continues that run family instead of starting fresh
            let run = match resume_run_family(store, &source_hash, config.swarm.max_attempts).await? {
                Some(run) => run,
                None => store.lock().await.start_run(NewRun {
                    project_name: project_name_from_path(path),
                    source_kind: SourceKind::Plan,
                    source_path: Some(path.display().to_string()),
                    source_hash,
                    worker_count: workers,
                })?,
            };

            let document = parse_plan(&content);
            let pending: Vec<_> = document.pending_tasks().cloned().collect();
            info!(
                total = document.tasks.len(),
                pending = pending.len(),
                "Parsed plan checklist"
            );

            // Content hashes already recorded in the run are not re-added:
            // completed and skipped records stay done, pending ones continue,
            // and failed ones went back to pending through retry_failed
            let existing: HashSet<String> = store
                .lock()
                .await
                .list_tasks(&run.run_id)?
                .into_iter()
                .map(|task| task.content_hash)
                .collect();

            let llm = analyzer_llm(config);
            let mut cache = PredictionCache::load(config.storage.state_root().join("predictions.json"));
            let listing = analyzer::tree_listing(repo_root);

            for task in &pending {
                if existing.contains(&content_hash(&task.text)) {
                    continue;
                }
                let predicted = match &llm {
                    Some(llm) => analyzer::predict_files_cached(llm, &mut cache, &task.text, &listing).await,
                    None => Vec::new(),
                };
                store.lock().await.add_task(
                    &run.run_id,
                    &task.text,
                    task.priority(),
                    &predicted,
                    Some(task.line as i64),
                )?;
            }
            cache.save()?;
            Ok((run, Some(path.clone())))
        }

        RunSource::Prompt(text) => {
            let source_hash = content_hash(text);

            // A resumed prompt run keeps its original decomposition; no
            // repeat LLM call
            if let Some(run) = resume_run_family(store, &source_hash, config.swarm.max_attempts).await? {
                return Ok((run, None));
            }

            let llm = create_client(&config.llm).context("Prompt mode requires a working LLM provider")?;
            let run = store.lock().await.start_run(NewRun {
                project_name: project_name_from_prompt(text),
                source_kind: SourceKind::Prompt,
                source_path: None,
                source_hash,
                worker_count: workers,
            })?;

            let decomposed = analyzer::decompose_prompt(&llm, text).await?;
            let mut cache = PredictionCache::load(config.storage.state_root().join("predictions.json"));
            let listing = analyzer::tree_listing(repo_root);

            for task in &decomposed {
                let predicted = if task.estimated_files.is_empty() {
                    analyzer::predict_files_cached(&llm, &mut cache, &task.task, &listing).await
                } else {
                    task.estimated_files.clone()
                };
                store
                    .lock()
                    .await
                    .add_task(&run.run_id, &task.task, task.priority, &predicted, None)?;
            }
            cache.save()?;
            Ok((run, None))
        }

        RunSource::Resume(prefix) => {
            let mut locked = store.lock().await;
            let run_id = resolve_run_id(&locked, prefix)?;
            let run = locked.get_run(&run_id)?;
            if run.status == RunStatus::Running {
                bail!("run {} is already active", run_id);
            }

            let plan_path = run.source_path.as_ref().map(PathBuf::from);
            Ok((reopen_run(&mut locked, &run_id, config.swarm.max_attempts)?, plan_path))
        }
    }
}

/// Startup resume detection: a terminal run with the same source hash is
/// reopened (failed tasks under the attempt cap reset to pending, pending
/// tasks continue). A still-active match is an error.
async fn resume_run_family(store: &SharedStore, source_hash: &str, max_attempts: i64) -> Result<Option<Run>> {
    let mut locked = store.lock().await;
    match locked.find_resumable_run(source_hash)? {
        None => Ok(None),
        Some(prev) if prev.status == RunStatus::Running => {
            bail!("run {} is already active for this source", prev.run_id)
        }
        Some(prev) => Ok(Some(reopen_run(&mut locked, &prev.run_id, max_attempts)?)),
    }
}

/// Reopen a terminal run: failed tasks under the attempt cap reset to
/// pending, then the run goes back to running
fn reopen_run(store: &mut Store, run_id: &str, max_attempts: i64) -> Result<Run> {
    let retried = store.retry_failed(run_id, max_attempts)?;
    store.set_run_status(run_id, RunStatus::Running)?;
    info!(%run_id, retried, "Resuming run");
    Ok(store.get_run(run_id)?)
}

/// The LLM is optional in plan mode: without it predictions are empty and
/// tasks simply lock nothing
fn analyzer_llm(config: &Config) -> Option<Arc<dyn LlmClient>> {
    match create_client(&config.llm) {
        Ok(llm) => Some(llm),
        Err(e) => {
            warn!(error = %e, "LLM unavailable, file predictions will be empty");
            None
        }
    }
}

fn agent_invocation(config: &Config) -> AgentInvocation {
    AgentInvocation {
        command: config.swarm.agent_command.clone(),
        args: config.swarm.agent_args.clone(),
        env: vec![
            ("RALPHSWARM_PROVIDER".to_string(), config.llm.provider.clone()),
            ("RALPHSWARM_MODEL".to_string(), config.llm.model.clone()),
        ],
        promise: config.swarm.completion_promise.clone(),
    }
}

/// Worker branches of a run, worker_num order, deduplicated across resumes
async fn worker_branches(store: &SharedStore, run_id: &str) -> Result<Vec<String>> {
    let workers = store.lock().await.list_workers(run_id)?;
    let mut seen = HashSet::new();
    Ok(workers
        .into_iter()
        .filter(|worker| seen.insert(worker.branch.clone()))
        .map(|worker| worker.branch)
        .collect())
}

/// Mark completed and skipped tasks done in the plan file
async fn write_plan_back(store: &SharedStore, run_id: &str, plan_path: &std::path::Path) -> Result<()> {
    let tasks = store.lock().await.list_tasks(run_id)?;
    let done_lines: HashSet<usize> = tasks
        .iter()
        .filter(|task| matches!(task.status, TaskStatus::Completed | TaskStatus::Skipped))
        .filter_map(|task| task.plan_line)
        .map(|line| line as usize)
        .collect();
    if done_lines.is_empty() {
        return Ok(());
    }

    let content = std::fs::read_to_string(plan_path).context("Cannot re-read plan for write-back")?;
    let updated = update_plan(&content, &done_lines);
    std::fs::write(plan_path, updated).context("Cannot write updated plan")?;
    info!(count = done_lines.len(), plan = %plan_path.display(), "Marked finished tasks in plan");
    Ok(())
}

/// Resolve a run id prefix against the store
pub fn resolve_run_id(store: &Store, prefix: &str) -> Result<String> {
    let matches: Vec<String> = store
        .list_runs()?
        .into_iter()
        .map(|run| run.run_id)
        .filter(|id| id.starts_with(prefix))
        .collect();
    match matches.len() {
        0 => bail!("no run matches '{}'", prefix),
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        n => bail!("'{}' is ambiguous ({} runs match)", prefix, n),
    }
}

fn project_name_from_path(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "swarm-project".to_string())
}

/// A short slug from the prompt's leading words
fn project_name_from_prompt(text: &str) -> String {
    let slug: String = text
        .split_whitespace()
        .take(4)
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() { "swarm-project".to_string() } else { slug }
}
