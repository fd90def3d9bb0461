//! SQLite-backed coordination store
//!
//! Single durable file per installation. Writers serialize through SQLite
//! (WAL journal, immediate transactions for claim paths); readers open the
//! same file read-only and never block the writer. Every mutation is a
//! transaction: partial writes are never observable.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use crate::conflict::sets_conflict;
use crate::model::{
    FileLock, Run, RunStats, RunStatus, SourceKind, Task, TaskStatus, Worker, WorkerStatus, new_run_id, new_worker_id,
    now_ms,
};

/// Current schema version, stored in `PRAGMA user_version`
const SCHEMA_VERSION: i64 = 1;

/// How long SQLite waits on a locked database before surfacing contention
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error types for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("an active run already exists for this source: {0}")]
    DuplicateActiveRun(String),

    #[error("another run is already active: {0}")]
    ActiveRunExists(String),

    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("unknown task: {0}")]
    UnknownTask(i64),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("task {task_id} is {actual}, expected {expected}")]
    WrongState {
        task_id: i64,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("record corrupt: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Busy/locked writes are contention: the caller retries with bounded
    /// backoff instead of treating them as failures
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

/// Parameters for starting a run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub project_name: String,
    pub source_kind: SourceKind,
    pub source_path: Option<String>,
    pub source_hash: String,
    pub worker_count: i64,
}

/// Task data handed back by a successful claim
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: i64,
    pub text: String,
    pub priority: i64,
    pub predicted_files: Vec<String>,
}

/// Durable coordination store over a single SQLite file
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path and apply migrations
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Store::open: called");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        let mut store = Self { conn };
        store.migrate()?;
        info!(path = %path.display(), "Opened coordination store");
        Ok(store)
    }

    /// Open an existing store read-only (dashboards, status commands).
    ///
    /// WAL mode lets these readers proceed while a writer is active.
    pub fn open_read_only(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Store::open_read_only: called");
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    fn configure(conn: &Connection) -> StoreResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }

    /// Idempotent schema creation and versioned migration
    fn migrate(&mut self) -> StoreResult<()> {
        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        debug!(version, "Store::migrate: current schema version");
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id          TEXT PRIMARY KEY,
                project_name    TEXT NOT NULL,
                status          TEXT NOT NULL,
                source_kind     TEXT NOT NULL,
                source_path     TEXT,
                source_hash     TEXT NOT NULL,
                worker_count    INTEGER NOT NULL,
                total_tasks     INTEGER NOT NULL DEFAULT 0,
                completed_tasks INTEGER NOT NULL DEFAULT 0,
                failed_tasks    INTEGER NOT NULL DEFAULT 0,
                skipped_tasks   INTEGER NOT NULL DEFAULT 0,
                started_at      INTEGER NOT NULL,
                completed_at    INTEGER
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id         INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id          TEXT NOT NULL REFERENCES runs(run_id),
                text            TEXT NOT NULL,
                content_hash    TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                assigned_worker TEXT,
                priority        INTEGER NOT NULL DEFAULT 0,
                predicted_files TEXT NOT NULL DEFAULT '[]',
                actual_files    TEXT NOT NULL DEFAULT '[]',
                plan_line       INTEGER,
                attempt_count   INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                skipped_commit  TEXT,
                commit_id       TEXT,
                tokens_in       INTEGER NOT NULL DEFAULT 0,
                tokens_out      INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                started_at      INTEGER,
                completed_at    INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_run_status ON tasks(run_id, status);

            CREATE TABLE IF NOT EXISTS workers (
                worker_id         TEXT PRIMARY KEY,
                run_id            TEXT NOT NULL REFERENCES runs(run_id),
                worker_num        INTEGER NOT NULL,
                pid               INTEGER NOT NULL,
                agent_pid         INTEGER,
                branch            TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'starting',
                current_task_id   INTEGER,
                work_dir          TEXT NOT NULL,
                started_at        INTEGER NOT NULL,
                last_heartbeat_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workers_run ON workers(run_id);

            CREATE TABLE IF NOT EXISTS file_locks (
                run_id      TEXT NOT NULL,
                pattern     TEXT NOT NULL,
                worker_id   TEXT NOT NULL,
                task_id     INTEGER NOT NULL,
                acquired_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, pattern)
            );
            "#,
        )?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
        info!(version = SCHEMA_VERSION, "Store schema migrated");
        Ok(())
    }

    // === Runs ===

    /// Create a new run. Fails while any other run is still active.
    pub fn start_run(&mut self, new: NewRun) -> StoreResult<Run> {
        debug!(project = %new.project_name, hash = %new.source_hash, "Store::start_run: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: Option<(String, String)> = tx
            .query_row(
                "SELECT run_id, source_hash FROM runs WHERE status = 'running' LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((run_id, hash)) = active {
            if hash == new.source_hash {
                return Err(StoreError::DuplicateActiveRun(run_id));
            }
            return Err(StoreError::ActiveRunExists(run_id));
        }

        let run_id = new_run_id();
        let now = now_ms();
        tx.execute(
            "INSERT INTO runs (run_id, project_name, status, source_kind, source_path, source_hash, worker_count, started_at)
             VALUES (?1, ?2, 'running', ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                new.project_name,
                new.source_kind.to_string(),
                new.source_path,
                new.source_hash,
                new.worker_count,
                now
            ],
        )?;
        tx.commit()?;

        info!(%run_id, "Started run");
        self.get_run(&run_id)
    }

    pub fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        self.conn
            .query_row("SELECT * FROM runs WHERE run_id = ?1", params![run_id], run_from_row)
            .optional()?
            .ok_or_else(|| StoreError::UnknownRun(run_id.to_string()))
    }

    /// The currently active run, if any
    pub fn find_active_run(&self) -> StoreResult<Option<Run>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM runs WHERE status = 'running' LIMIT 1", [], run_from_row)
            .optional()?)
    }

    /// Most recent run with the given source hash, any status.
    ///
    /// A match means a later invocation is a resume of the same run family.
    pub fn find_resumable_run(&self, source_hash: &str) -> StoreResult<Option<Run>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM runs WHERE source_hash = ?1 ORDER BY run_id DESC LIMIT 1",
                params![source_hash],
                run_from_row,
            )
            .optional()?)
    }

    pub fn list_runs(&self) -> StoreResult<Vec<Run>> {
        let mut stmt = self.conn.prepare("SELECT * FROM runs ORDER BY run_id")?;
        let runs = stmt.query_map([], run_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn set_run_status(&mut self, run_id: &str, status: RunStatus) -> StoreResult<()> {
        debug!(%run_id, %status, "Store::set_run_status: called");
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?1 WHERE run_id = ?2",
            params![status.to_string(), run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRun(run_id.to_string()));
        }
        Ok(())
    }

    /// Close out a run: stamp completion time and snapshot the aggregates
    pub fn finish_run(&mut self, run_id: &str, status: RunStatus) -> StoreResult<Run> {
        debug!(%run_id, %status, "Store::finish_run: called");
        let stats = self.aggregate_stats(run_id)?;
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2,
                    total_tasks = ?3, completed_tasks = ?4, failed_tasks = ?5, skipped_tasks = ?6
             WHERE run_id = ?7",
            params![
                status.to_string(),
                now_ms(),
                stats.total,
                stats.completed,
                stats.failed,
                stats.skipped,
                run_id
            ],
        )?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::UnknownRun(run_id.to_string()));
        }
        info!(%run_id, %status, completed = stats.completed, failed = stats.failed, skipped = stats.skipped, "Run finished");
        self.get_run(run_id)
    }

    // === Tasks ===

    /// Insert a task and bump the run's task total
    pub fn add_task(
        &mut self,
        run_id: &str,
        text: &str,
        priority: i64,
        predicted_files: &[String],
        plan_line: Option<i64>,
    ) -> StoreResult<i64> {
        debug!(%run_id, priority, patterns = predicted_files.len(), "Store::add_task: called");
        let tx = self.conn.transaction()?;
        let exists: Option<String> = tx
            .query_row("SELECT run_id FROM runs WHERE run_id = ?1", params![run_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownRun(run_id.to_string()));
        }

        tx.execute(
            "INSERT INTO tasks (run_id, text, content_hash, priority, predicted_files, plan_line, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                text,
                crate::model::content_hash(text),
                priority,
                serde_json::to_string(predicted_files)?,
                plan_line,
                now_ms()
            ],
        )?;
        let task_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE runs SET total_tasks = total_tasks + 1 WHERE run_id = ?1",
            params![run_id],
        )?;
        tx.commit()?;
        Ok(task_id)
    }

    pub fn get_task(&self, task_id: i64) -> StoreResult<Task> {
        self.conn
            .query_row("SELECT * FROM tasks WHERE task_id = ?1", params![task_id], task_from_row)
            .optional()?
            .ok_or(StoreError::UnknownTask(task_id))?
    }

    pub fn list_tasks(&self, run_id: &str) -> StoreResult<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM tasks WHERE run_id = ?1 ORDER BY task_id")?;
        let tasks = stmt
            .query_map(params![run_id], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        tasks.into_iter().collect()
    }

    /// Atomically claim the next runnable task for a worker.
    ///
    /// Selects the first pending task in (priority ASC, task_id ASC) order
    /// whose predicted patterns conflict with no currently held lock and no
    /// caller-supplied excluded pattern, acquires its locks, marks it
    /// in_progress, and marks the worker busy — all in one immediate
    /// transaction, so no two workers can ever claim the same task.
    pub fn claim_next_task(
        &mut self,
        run_id: &str,
        worker_id: &str,
        excluded_patterns: &[String],
    ) -> StoreResult<Option<ClaimedTask>> {
        debug!(%run_id, %worker_id, excluded = excluded_patterns.len(), "Store::claim_next_task: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<(i64, String, i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT task_id, text, priority, predicted_files FROM tasks
                 WHERE run_id = ?1 AND status = 'pending'
                 ORDER BY priority ASC, task_id ASC",
            )?;
            stmt.query_map(params![run_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };

        for (task_id, text, priority, predicted_json) in candidates {
            let predicted: Vec<String> = serde_json::from_str(&predicted_json)?;
            if !try_acquire_locks(&tx, run_id, worker_id, task_id, &predicted, excluded_patterns)? {
                continue;
            }

            let now = now_ms();
            tx.execute(
                "UPDATE tasks SET status = 'in_progress', assigned_worker = ?1, started_at = ?2
                 WHERE task_id = ?3",
                params![worker_id, now, task_id],
            )?;
            tx.execute(
                "UPDATE workers SET status = 'busy', current_task_id = ?1 WHERE worker_id = ?2",
                params![task_id, worker_id],
            )?;
            tx.commit()?;

            debug!(%worker_id, task_id, priority, "Claimed task");
            return Ok(Some(ClaimedTask {
                task_id,
                text,
                priority,
                predicted_files: predicted,
            }));
        }

        Ok(None)
    }

    /// The task currently assigned to a worker, if any
    pub fn assigned_task(&self, worker_id: &str) -> StoreResult<Option<Task>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM tasks WHERE assigned_worker = ?1 AND status = 'in_progress' LIMIT 1",
                params![worker_id],
                task_from_row,
            )
            .optional()?
            .transpose()?)
    }

    /// Transition a task to completed, release its locks, idle its worker
    pub fn complete_task(&mut self, task_id: i64, actual_files: &[String]) -> StoreResult<()> {
        debug!(task_id, files = actual_files.len(), "Store::complete_task: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (status, worker) = task_state(&tx, task_id)?;
        if status != TaskStatus::InProgress {
            return Err(StoreError::WrongState {
                task_id,
                expected: TaskStatus::InProgress,
                actual: status,
            });
        }

        tx.execute(
            "UPDATE tasks SET status = 'completed', actual_files = ?1, completed_at = ?2, assigned_worker = NULL
             WHERE task_id = ?3",
            params![serde_json::to_string(actual_files)?, now_ms(), task_id],
        )?;
        release_task_artifacts(&tx, task_id, worker.as_deref())?;
        tx.commit()?;
        info!(task_id, "Task completed");
        Ok(())
    }

    /// Record a resume-by-commit skip: the work already exists as a commit
    pub fn skip_task(&mut self, task_id: i64, commit_id: &str) -> StoreResult<()> {
        debug!(task_id, %commit_id, "Store::skip_task: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (status, worker) = task_state(&tx, task_id)?;
        if status != TaskStatus::InProgress {
            return Err(StoreError::WrongState {
                task_id,
                expected: TaskStatus::InProgress,
                actual: status,
            });
        }

        tx.execute(
            "UPDATE tasks SET status = 'skipped', skipped_commit = ?1, completed_at = ?2, assigned_worker = NULL
             WHERE task_id = ?3",
            params![commit_id, now_ms(), task_id],
        )?;
        release_task_artifacts(&tx, task_id, worker.as_deref())?;
        tx.commit()?;
        info!(task_id, %commit_id, "Task skipped by commit match");
        Ok(())
    }

    /// Fail a task. Retryable failures under the attempt cap return to
    /// pending; everything else is terminal.
    pub fn fail_task(&mut self, task_id: i64, error: &str, retryable: bool, max_attempts: i64) -> StoreResult<()> {
        debug!(task_id, retryable, max_attempts, "Store::fail_task: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (status, worker) = task_state(&tx, task_id)?;
        if status != TaskStatus::InProgress {
            return Err(StoreError::WrongState {
                task_id,
                expected: TaskStatus::InProgress,
                actual: status,
            });
        }

        let attempts: i64 = tx.query_row(
            "SELECT attempt_count FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        let attempts = attempts + 1;

        if retryable && attempts < max_attempts {
            tx.execute(
                "UPDATE tasks SET status = 'pending', assigned_worker = NULL, started_at = NULL,
                        attempt_count = ?1, last_error = ?2
                 WHERE task_id = ?3",
                params![attempts, error, task_id],
            )?;
            info!(task_id, attempts, "Task failed, returned to pending");
        } else {
            tx.execute(
                "UPDATE tasks SET status = 'failed', assigned_worker = NULL, completed_at = ?1,
                        attempt_count = ?2, last_error = ?3
                 WHERE task_id = ?4",
                params![now_ms(), attempts, error, task_id],
            )?;
            info!(task_id, attempts, "Task failed terminally");
        }
        release_task_artifacts(&tx, task_id, worker.as_deref())?;
        tx.commit()?;
        Ok(())
    }

    /// Record what an agent execution produced: the worker's commit and the
    /// token totals summed over its step stream
    pub fn record_task_execution(
        &mut self,
        task_id: i64,
        commit_id: Option<&str>,
        tokens_in: i64,
        tokens_out: i64,
    ) -> StoreResult<()> {
        debug!(task_id, ?commit_id, tokens_in, tokens_out, "Store::record_task_execution: called");
        let changed = self.conn.execute(
            "UPDATE tasks SET commit_id = ?1, tokens_in = tokens_in + ?2, tokens_out = tokens_out + ?3
             WHERE task_id = ?4",
            params![commit_id, tokens_in, tokens_out, task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownTask(task_id));
        }
        Ok(())
    }

    /// Reset failed tasks with attempts below the cap back to pending.
    /// Returns how many were reset.
    pub fn retry_failed(&mut self, run_id: &str, max_attempts: i64) -> StoreResult<usize> {
        debug!(%run_id, max_attempts, "Store::retry_failed: called");
        let changed = self.conn.execute(
            "UPDATE tasks SET status = 'pending', last_error = NULL, completed_at = NULL
             WHERE run_id = ?1 AND status = 'failed' AND attempt_count < ?2",
            params![run_id, max_attempts],
        )?;
        info!(%run_id, changed, "Reset failed tasks to pending");
        Ok(changed)
    }

    pub fn aggregate_stats(&self, run_id: &str) -> StoreResult<RunStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks WHERE run_id = ?1 GROUP BY status")?;
        let counts: Vec<(String, i64)> = stmt
            .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = RunStats::default();
        for (status, count) in counts {
            stats.total += count;
            match status.parse::<TaskStatus>().map_err(StoreError::Corrupt)? {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::InProgress => stats.in_progress = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
                TaskStatus::Skipped => stats.skipped = count,
            }
        }
        Ok(stats)
    }

    // === Workers ===

    /// Register a worker for a run; returns its id
    pub fn register_worker(
        &mut self,
        run_id: &str,
        worker_num: i64,
        pid: i64,
        branch: &str,
        work_dir: &str,
    ) -> StoreResult<String> {
        debug!(%run_id, worker_num, pid, %branch, "Store::register_worker: called");
        let worker_id = new_worker_id();
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO workers (worker_id, run_id, worker_num, pid, branch, status, work_dir, started_at, last_heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'starting', ?6, ?7, ?7)",
            params![worker_id, run_id, worker_num, pid, branch, work_dir, now],
        )?;
        info!(%run_id, worker_num, %worker_id, "Registered worker");
        Ok(worker_id)
    }

    pub fn get_worker(&self, worker_id: &str) -> StoreResult<Worker> {
        self.conn
            .query_row(
                "SELECT * FROM workers WHERE worker_id = ?1",
                params![worker_id],
                worker_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownWorker(worker_id.to_string()))
    }

    pub fn list_workers(&self, run_id: &str) -> StoreResult<Vec<Worker>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM workers WHERE run_id = ?1 ORDER BY worker_num")?;
        let workers = stmt
            .query_map(params![run_id], worker_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(workers)
    }

    /// Refresh a worker's liveness timestamp
    pub fn heartbeat(&mut self, worker_id: &str) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE workers SET last_heartbeat_at = ?1 WHERE worker_id = ?2",
            params![now_ms(), worker_id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownWorker(worker_id.to_string()));
        }
        Ok(())
    }

    pub fn set_worker_status(
        &mut self,
        worker_id: &str,
        status: WorkerStatus,
        current_task_id: Option<i64>,
    ) -> StoreResult<()> {
        debug!(%worker_id, %status, ?current_task_id, "Store::set_worker_status: called");
        let changed = self.conn.execute(
            "UPDATE workers SET status = ?1, current_task_id = ?2 WHERE worker_id = ?3",
            params![status.to_string(), current_task_id, worker_id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownWorker(worker_id.to_string()));
        }
        Ok(())
    }

    /// Record (or clear) the pid of the worker's live agent subprocess
    pub fn set_agent_pid(&mut self, worker_id: &str, agent_pid: Option<i64>) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE workers SET agent_pid = ?1 WHERE worker_id = ?2",
            params![agent_pid, worker_id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownWorker(worker_id.to_string()));
        }
        Ok(())
    }

    /// Workers whose heartbeat has lapsed past the threshold
    pub fn find_stale_workers(&self, run_id: &str, stale_threshold: Duration) -> StoreResult<Vec<Worker>> {
        let cutoff = now_ms() - stale_threshold.as_millis() as i64;
        let mut stmt = self.conn.prepare(
            "SELECT * FROM workers
             WHERE run_id = ?1 AND last_heartbeat_at < ?2 AND status IN ('busy', 'idle')
             ORDER BY worker_num",
        )?;
        let workers = stmt
            .query_map(params![run_id, cutoff], worker_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(workers)
    }

    /// Tear down a stale worker: release its locks, return its task to
    /// pending with an incremented attempt count, and mark it dead.
    pub fn reassign_worker_task(&mut self, worker_id: &str) -> StoreResult<Option<i64>> {
        debug!(%worker_id, "Store::reassign_worker_task: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let task_id: Option<i64> = tx
            .query_row(
                "SELECT current_task_id FROM workers WHERE worker_id = ?1",
                params![worker_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownWorker(worker_id.to_string()))?;

        delete_worker_locks(&tx, worker_id)?;
        if let Some(task_id) = task_id {
            tx.execute(
                "UPDATE tasks SET status = 'pending', assigned_worker = NULL, started_at = NULL,
                        attempt_count = attempt_count + 1
                 WHERE task_id = ?1 AND status = 'in_progress'",
                params![task_id],
            )?;
        }
        tx.execute(
            "UPDATE workers SET status = 'dead', current_task_id = NULL WHERE worker_id = ?1",
            params![worker_id],
        )?;
        tx.commit()?;
        info!(%worker_id, ?task_id, "Reassigned stale worker's task");
        Ok(task_id)
    }

    // === Locks ===

    /// All-or-nothing lock acquisition. Returns false (acquiring nothing)
    /// when any requested pattern conflicts with an existing lock.
    pub fn acquire_locks(
        &mut self,
        run_id: &str,
        worker_id: &str,
        task_id: i64,
        patterns: &[String],
    ) -> StoreResult<bool> {
        debug!(%run_id, %worker_id, task_id, count = patterns.len(), "Store::acquire_locks: called");
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !try_acquire_locks(&tx, run_id, worker_id, task_id, patterns, &[])? {
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    /// Release every lock a worker holds
    pub fn release_locks(&mut self, worker_id: &str) -> StoreResult<usize> {
        debug!(%worker_id, "Store::release_locks: called");
        Ok(delete_worker_locks(&self.conn, worker_id)?)
    }

    pub fn list_locks(&self, run_id: &str) -> StoreResult<Vec<FileLock>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id, pattern, worker_id, task_id, acquired_at FROM file_locks WHERE run_id = ?1")?;
        let locks = stmt
            .query_map(params![run_id], |row| {
                Ok(FileLock {
                    run_id: row.get(0)?,
                    pattern: row.get(1)?,
                    worker_id: row.get(2)?,
                    task_id: row.get(3)?,
                    acquired_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(locks)
    }
}

/// Conflict-check `patterns` against every lock held in the run (plus any
/// caller-supplied excluded patterns) and insert them all, or insert
/// nothing. Runs inside the caller's transaction; both the public
/// `acquire_locks` and the claim path go through here.
fn try_acquire_locks(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    worker_id: &str,
    task_id: i64,
    patterns: &[String],
    excluded: &[String],
) -> StoreResult<bool> {
    let mut held: Vec<String> = {
        let mut stmt = tx.prepare("SELECT pattern FROM file_locks WHERE run_id = ?1")?;
        stmt.query_map(params![run_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?
    };
    held.extend_from_slice(excluded);
    if sets_conflict(patterns, &held) {
        return Ok(false);
    }

    let now = now_ms();
    let mut unique = patterns.to_vec();
    unique.sort();
    unique.dedup();
    for pattern in &unique {
        tx.execute(
            "INSERT INTO file_locks (run_id, pattern, worker_id, task_id, acquired_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, pattern, worker_id, task_id, now],
        )?;
    }
    Ok(true)
}

/// Remove every lock a worker holds; every release path funnels through
/// this one statement
fn delete_worker_locks(conn: &rusqlite::Connection, worker_id: &str) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM file_locks WHERE worker_id = ?1", params![worker_id])
}

/// Fetch a task's status and assigned worker inside a transaction
fn task_state(tx: &rusqlite::Transaction<'_>, task_id: i64) -> StoreResult<(TaskStatus, Option<String>)> {
    let row: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT status, assigned_worker FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (status, worker) = row.ok_or(StoreError::UnknownTask(task_id))?;
    Ok((status.parse().map_err(StoreError::Corrupt)?, worker))
}

/// Drop the locks for a terminated task and idle its worker
fn release_task_artifacts(tx: &rusqlite::Transaction<'_>, task_id: i64, worker_id: Option<&str>) -> StoreResult<()> {
    match worker_id {
        Some(worker_id) => {
            delete_worker_locks(tx, worker_id)?;
            tx.execute(
                "UPDATE workers SET status = 'idle', current_task_id = NULL WHERE worker_id = ?1",
                params![worker_id],
            )?;
        }
        // An in_progress task without a worker violates an invariant; drop
        // whatever locks are keyed to it and move on
        None => {
            tx.execute("DELETE FROM file_locks WHERE task_id = ?1", params![task_id])?;
        }
    }
    Ok(())
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        run_id: row.get("run_id")?,
        project_name: row.get("project_name")?,
        status: parse_column(row, "status")?,
        source_kind: parse_column(row, "source_kind")?,
        source_path: row.get("source_path")?,
        source_hash: row.get("source_hash")?,
        worker_count: row.get("worker_count")?,
        total_tasks: row.get("total_tasks")?,
        completed_tasks: row.get("completed_tasks")?,
        failed_tasks: row.get("failed_tasks")?,
        skipped_tasks: row.get("skipped_tasks")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Task>> {
    let predicted: String = row.get("predicted_files")?;
    let actual: String = row.get("actual_files")?;
    let task = Task {
        task_id: row.get("task_id")?,
        run_id: row.get("run_id")?,
        text: row.get("text")?,
        content_hash: row.get("content_hash")?,
        status: parse_column(row, "status")?,
        assigned_worker: row.get("assigned_worker")?,
        priority: row.get("priority")?,
        predicted_files: Vec::new(),
        actual_files: Vec::new(),
        plan_line: row.get("plan_line")?,
        attempt_count: row.get("attempt_count")?,
        last_error: row.get("last_error")?,
        skipped_commit: row.get("skipped_commit")?,
        commit_id: row.get("commit_id")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    };
    Ok(hydrate_task(task, &predicted, &actual))
}

/// JSON columns decode outside the rusqlite row callback so their errors
/// surface as StoreError rather than panics
fn hydrate_task(mut task: Task, predicted: &str, actual: &str) -> StoreResult<Task> {
    task.predicted_files = serde_json::from_str(predicted)?;
    task.actual_files = serde_json::from_str(actual)?;
    Ok(task)
}

fn worker_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worker> {
    Ok(Worker {
        worker_id: row.get("worker_id")?,
        run_id: row.get("run_id")?,
        worker_num: row.get("worker_num")?,
        pid: row.get("pid")?,
        agent_pid: row.get("agent_pid")?,
        branch: row.get("branch")?,
        status: parse_column(row, "status")?,
        current_task_id: row.get("current_task_id")?,
        work_dir: row.get("work_dir")?,
        started_at: row.get("started_at")?,
        last_heartbeat_at: row.get("last_heartbeat_at")?,
    })
}

/// Parse a text column into its enum, mapping bad data to a conversion error
fn parse_column<T>(row: &rusqlite::Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let text: String = row.get(column)?;
    text.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(std::io::Error::other(e)))
    })
}
