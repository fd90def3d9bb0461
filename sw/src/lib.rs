//! RalphSwarm - parallel coding-agent swarm orchestrator
//!
//! RalphSwarm turns a devplan (or a free-text prompt) into a scheduled work
//! graph and executes it with N autonomous coding-agent workers, each in an
//! isolated git checkout on its own branch. All coordination goes through
//! the durable store in the `swarmstore` crate: tasks are claimed atomically
//! under advisory file locks, crashed workers are detected by heartbeat and
//! their tasks reassigned, and completed branches merge into a single
//! published project tree.
//!
//! # Modules
//!
//! - [`analyzer`] - plan parsing, prompt decomposition, file prediction
//! - [`worktree`] - per-worker checkouts, merge, extract
//! - [`worker`] - the worker loop and agent CLI driver
//! - [`scheduler`] - per-run assignment/staleness/completion loop
//! - [`orchestrator`] - top-level run lifecycle
//! - [`llm`] - LLM client used by the analyzer
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

use std::sync::Arc;

use tokio::sync::Mutex;

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod scheduler;
pub mod summary;
pub mod worker;
pub mod worktree;

/// The one process-wide handle: a serialized writer over the store.
/// Everything else travels as explicit parameters.
pub type SharedStore = Arc<Mutex<swarmstore::Store>>;

/// Resolve once the stop flag flips to true.
///
/// A dropped sender parks forever instead of resolving, so select! loops
/// degrade to plain polling rather than spinning.
pub(crate) async fn stop_signalled(rx: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// Re-export commonly used types
pub use config::{Config, GitConfig, LlmConfig, StorageConfig, SwarmConfig};
pub use orchestrator::{RunSource, RunSummary, run_swarm};
pub use scheduler::{SchedulerConfig, SchedulerOutcome, run_scheduler};
pub use worker::{AgentInvocation, WorkerContext, run_worker};
pub use worktree::{ConflictRecord, MergeOutcome, WorktreeConfig, WorktreeError, WorktreeManager};
