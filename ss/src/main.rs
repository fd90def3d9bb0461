//! swarmstore - read-only inspector for the swarm coordination store
//!
//! Dashboards and operators use this to watch a run without ever blocking
//! the orchestrator's writer connection.

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, bail};

use swarmstore::{Store, TaskStatus, WorkerStatus};

mod cli;

use cli::{Cli, Command, default_store_path};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.store.unwrap_or_else(default_store_path);
    let store = Store::open_read_only(&path).context(format!("Failed to open store at {}", path.display()))?;

    match cli.command {
        Command::Runs => {
            for run in store.list_runs()? {
                let status = colorize_run_status(&run.status.to_string());
                println!(
                    "{}  {}  {}  tasks={} completed={} failed={} skipped={}",
                    run.run_id,
                    status,
                    run.project_name,
                    run.total_tasks,
                    run.completed_tasks,
                    run.failed_tasks,
                    run.skipped_tasks
                );
            }
        }
        Command::Tasks { run_id } => {
            let run_id = resolve_run(&store, &run_id)?;
            for task in store.list_tasks(&run_id)? {
                let status = colorize_task_status(task.status);
                let worker = task.assigned_worker.as_deref().unwrap_or("-");
                println!(
                    "{:>5}  {}  p{}  attempts={}  worker={}  {}",
                    task.task_id,
                    status,
                    task.priority,
                    task.attempt_count,
                    worker,
                    truncate(&task.text, 60)
                );
                if let Some(error) = &task.last_error {
                    println!("       {} {}", "error:".red(), truncate(error, 70));
                }
            }
        }
        Command::Workers { run_id } => {
            let run_id = resolve_run(&store, &run_id)?;
            for worker in store.list_workers(&run_id)? {
                let status = colorize_worker_status(worker.status);
                let task = worker
                    .current_task_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let age_ms = swarmstore::now_ms() - worker.last_heartbeat_at;
                println!(
                    "worker-{}  {}  pid={}  task={}  branch={}  heartbeat={}ms ago",
                    worker.worker_num, status, worker.pid, task, worker.branch, age_ms
                );
            }
        }
        Command::Stats { run_id } => {
            let run_id = resolve_run(&store, &run_id)?;
            let stats = store.aggregate_stats(&run_id)?;
            println!("total:       {}", stats.total);
            println!("pending:     {}", stats.pending);
            println!("in_progress: {}", stats.in_progress);
            println!("{}   {}", "completed:".green(), stats.completed);
            println!("{}      {}", "failed:".red(), stats.failed);
            println!("skipped:     {}", stats.skipped);
        }
        Command::Locks { run_id } => {
            let run_id = resolve_run(&store, &run_id)?;
            for lock in store.list_locks(&run_id)? {
                println!("{}  task={}  worker={}", lock.pattern, lock.task_id, lock.worker_id);
            }
        }
    }

    Ok(())
}

/// Resolve a run id prefix to a full run id
fn resolve_run(store: &Store, prefix: &str) -> Result<String> {
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

fn colorize_run_status(status: &str) -> String {
    match status {
        "running" => status.cyan().to_string(),
        "completed" => status.green().to_string(),
        "failed" => status.red().to_string(),
        _ => status.yellow().to_string(),
    }
}

fn colorize_task_status(status: TaskStatus) -> String {
    let text = format!("{:<11}", status.to_string());
    match status {
        TaskStatus::Completed => text.green().to_string(),
        TaskStatus::Failed => text.red().to_string(),
        TaskStatus::InProgress => text.cyan().to_string(),
        TaskStatus::Skipped => text.blue().to_string(),
        TaskStatus::Pending => text.normal().to_string(),
    }
}

fn colorize_worker_status(status: WorkerStatus) -> String {
    let text = status.to_string();
    match status {
        WorkerStatus::Busy => text.cyan().to_string(),
        WorkerStatus::Idle => text.green().to_string(),
        WorkerStatus::Dead | WorkerStatus::Stale => text.red().to_string(),
        WorkerStatus::Starting => text.yellow().to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}
