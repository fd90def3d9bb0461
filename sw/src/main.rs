//! swarm - parallel coding-agent orchestrator CLI entry point

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, bail};
use tracing::{info, warn};

use ralphswarm::cli::{Cli, Command, OutputFormat};
use ralphswarm::config::Config;
use ralphswarm::analyzer::parse_plan;
use ralphswarm::orchestrator::{RunOverrides, RunSource, run_swarm};
use ralphswarm::summary::print_summary;
use swarmstore::{RunStatus, Store};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ralphswarm")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN" | "WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(log_dir.join("ralphswarm.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref())?;

    match cli.command {
        Command::Plan { plan, workers, timeout } => {
            let summary = run_swarm(
                config,
                RunSource::Plan(plan),
                RunOverrides {
                    workers,
                    timeout_secs: timeout,
                },
            )
            .await?;
            print_summary(&summary);
        }

        Command::Prompt { prompt, workers } => {
            let summary = run_swarm(
                config,
                RunSource::Prompt(prompt),
                RunOverrides {
                    workers,
                    timeout_secs: None,
                },
            )
            .await?;
            print_summary(&summary);
        }

        Command::Analyze { plan } => analyze_plan(&plan)?,

        Command::Resume { run_id, workers } => {
            let summary = run_swarm(
                config,
                RunSource::Resume(run_id),
                RunOverrides {
                    workers,
                    timeout_secs: None,
                },
            )
            .await?;
            print_summary(&summary);
        }

        Command::Stop => stop_active_run(&config)?,

        Command::EmergencyStop => emergency_stop(&config)?,

        Command::Status { format } => show_status(&config, format)?,
    }

    Ok(())
}

/// Parse the plan and print what would run, without executing anything
fn analyze_plan(plan: &PathBuf) -> Result<()> {
    let content = fs::read_to_string(plan).context(format!("Cannot read plan file {}", plan.display()))?;
    let document = parse_plan(&content);

    println!("{} tasks ({} pending):\n", document.tasks.len(), document.pending_tasks().count());
    for task in &document.tasks {
        let marker = match task.state {
            ralphswarm::analyzer::ChecklistState::Pending => "pending ".normal(),
            ralphswarm::analyzer::ChecklistState::Done => "done    ".green(),
            ralphswarm::analyzer::ChecklistState::InProgress => "progress".cyan(),
        };
        println!("  line {:>4}  p{}  {}  {}", task.line, task.priority(), marker, task.text);
    }
    Ok(())
}

/// Gracefully stop the active run via the store; the running orchestrator's
/// scheduler observes the status change within a poll interval
fn stop_active_run(config: &Config) -> Result<()> {
    let mut store = Store::open(config.storage.store_path()).context("Coordination store is unavailable")?;
    let Some(run) = store.find_active_run()? else {
        bail!("no active run");
    };
    store.set_run_status(&run.run_id, RunStatus::Stopped)?;
    println!("Stopping run {}", run.run_id);
    Ok(())
}

/// Forcibly kill every recorded worker and agent process of the active run
fn emergency_stop(config: &Config) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let mut store = Store::open(config.storage.store_path()).context("Coordination store is unavailable")?;
    let Some(run) = store.find_active_run()? else {
        bail!("no active run");
    };

    let own_pid = std::process::id() as i64;
    let mut killed = 0usize;
    for worker in store.list_workers(&run.run_id)? {
        for pid in [worker.agent_pid, Some(worker.pid)].into_iter().flatten() {
            if pid == own_pid || pid <= 0 {
                continue;
            }
            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    killed += 1;
                    info!(pid, worker_num = worker.worker_num, "Killed process");
                }
                Err(e) => warn!(pid, error = %e, "Could not kill process"),
            }
        }
    }

    store.set_run_status(&run.run_id, RunStatus::Stopped)?;
    println!("Emergency stop: run {} marked stopped, {} processes killed", run.run_id, killed);
    Ok(())
}

/// Read-only status view of the active (or most recent) run
fn show_status(config: &Config, format: OutputFormat) -> Result<()> {
    let store = Store::open_read_only(config.storage.store_path()).context("Coordination store is unavailable")?;
    let run = match store.find_active_run()? {
        Some(run) => run,
        None => match store.list_runs()?.into_iter().next_back() {
            Some(run) => run,
            None => {
                println!("No runs recorded");
                return Ok(());
            }
        },
    };
    let stats = store.aggregate_stats(&run.run_id)?;
    let workers = store.list_workers(&run.run_id)?;

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "run": run,
                "stats": stats,
                "workers": workers,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("run {}  [{}]  project={}", run.run_id, run.status, run.project_name);
            println!(
                "tasks: total={} pending={} in_progress={} completed={} failed={} skipped={}",
                stats.total, stats.pending, stats.in_progress, stats.completed, stats.failed, stats.skipped
            );
            println!();
            println!("{:<10} {:<8} {:<8} {:<6} {}", "worker", "status", "task", "pid", "heartbeat");
            for worker in workers {
                let task = worker
                    .current_task_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let age_ms = swarmstore::now_ms() - worker.last_heartbeat_at;
                println!(
                    "{:<10} {:<8} {:<8} {:<6} {}ms ago",
                    format!("worker-{}", worker.worker_num),
                    worker.status.to_string(),
                    task,
                    worker.pid,
                    age_ms
                );
            }
        }
    }
    Ok(())
}
