//! SwarmStore - durable swarm coordination over SQLite
//!
//! The single source of truth for a swarm run: run, task, worker, and
//! file-lock records with atomic claim primitives. Every component of the
//! orchestrator reads and writes through this crate; workers never share
//! memory, only rows.
//!
//! Concurrency model: one writer at a time (SQLite WAL + immediate
//! transactions), any number of read-only handles that never block the
//! writer. `claim_next_task` selects, locks, and assigns in a single
//! transaction so a task can only ever be claimed once per attempt.

pub mod conflict;
pub mod model;
pub mod store;

pub use conflict::{patterns_conflict, sets_conflict, wildcard_prefix};
pub use model::{
    FileLock, Run, RunStats, RunStatus, SourceKind, Task, TaskStatus, Worker, WorkerStatus, content_hash, new_run_id,
    now_ms,
};
pub use store::{ClaimedTask, NewRun, Store, StoreError, StoreResult};
