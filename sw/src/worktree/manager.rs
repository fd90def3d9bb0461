//! Worktree manager: base checkout normalization and per-worker isolation
//!
//! Every worker gets its own git worktree at a deterministic path, on a
//! fresh branch forked from the integration head. Workers never share a
//! working tree; cross-worker integration happens only at merge time.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("failed to create worker checkout: {0}")]
    CreateFailed(String),

    #[error("failed to remove worker checkout: {0}")]
    RemoveFailed(String),

    #[error("checkout not found: {0}")]
    NotFound(String),

    #[error("git command failed: {0}")]
    GitError(String),
}

/// Configuration for the worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Path to the base repository
    pub repo_root: PathBuf,

    /// Root for per-run worker checkouts
    pub state_root: PathBuf,

    /// Branch worker results integrate into
    pub integration_branch: String,

    /// Prefix for worker branches
    pub branch_prefix: String,
}

/// A worker's isolated checkout
#[derive(Debug, Clone)]
pub struct WorkerCheckout {
    pub worker_num: i64,
    pub path: PathBuf,
    pub branch: String,
}

/// Manager for the base checkout and per-worker worktrees
pub struct WorktreeManager {
    config: WorktreeConfig,
}

/// Run a git command, returning trimmed stdout or the stderr as error
async fn run_git(repo: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    debug!(?args, repo = %repo.display(), "run_git: called");
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| WorktreeError::GitError(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::GitError(format!("git {}: {}", args.join(" "), stderr.trim())));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        Self { config }
    }

    pub fn integration_branch(&self) -> &str {
        &self.config.integration_branch
    }

    pub fn repo_root(&self) -> &Path {
        &self.config.repo_root
    }

    /// Deterministic checkout path for a worker
    pub fn checkout_path(&self, run_id: &str, worker_num: i64) -> PathBuf {
        self.config
            .state_root
            .join(run_id)
            .join(format!("worker-{worker_num}"))
            .join("repo")
    }

    /// Branch name for a worker
    pub fn branch_name(&self, run_id: &str, worker_num: i64) -> String {
        format!("{}/{}/worker-{}", self.config.branch_prefix, run_id, worker_num)
    }

    /// Resolve and normalize the base repository.
    ///
    /// Workers assume the integration branch exists, so a repo whose head is
    /// named differently gets its current branch renamed. An unborn head
    /// (fresh `git init`) receives an empty root commit first.
    pub async fn prepare_base(&self) -> Result<(), WorktreeError> {
        debug!("WorktreeManager::prepare_base: called");
        let inside = run_git(&self.config.repo_root, &["rev-parse", "--is-inside-work-tree"])
            .await
            .map_err(|_| WorktreeError::NotARepo(self.config.repo_root.display().to_string()))?;
        if inside != "true" {
            return Err(WorktreeError::NotARepo(self.config.repo_root.display().to_string()));
        }

        if run_git(&self.config.repo_root, &["rev-parse", "--verify", "HEAD"]).await.is_err() {
            info!("Base repository has no commits, creating root commit");
            run_git(
                &self.config.repo_root,
                &["commit", "--allow-empty", "-m", "swarm: root commit"],
            )
            .await?;
        }

        let current = run_git(&self.config.repo_root, &["symbolic-ref", "--short", "HEAD"]).await?;
        if current != self.config.integration_branch {
            info!(
                from = %current,
                to = %self.config.integration_branch,
                "Renaming head branch to the integration branch"
            );
            run_git(
                &self.config.repo_root,
                &["branch", "-m", &current, &self.config.integration_branch],
            )
            .await?;
        }

        Ok(())
    }

    /// Create (or on resume, reuse) an isolated checkout for a worker
    pub async fn create(&self, run_id: &str, worker_num: i64) -> Result<WorkerCheckout, WorktreeError> {
        debug!(%run_id, worker_num, "WorktreeManager::create: called");
        let path = self.checkout_path(run_id, worker_num);
        let branch = self.branch_name(run_id, worker_num);

        if path.exists() {
            debug!(path = %path.display(), "WorktreeManager::create: reusing existing checkout");
            run_git(&path, &["status", "--porcelain"])
                .await
                .map_err(|_| WorktreeError::CreateFailed(format!("existing checkout unusable: {}", path.display())))?;
            return Ok(WorkerCheckout { worker_num, path, branch });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WorktreeError::CreateFailed(format!("failed to create state dir: {e}")))?;
        }

        let path_str = path.display().to_string();
        let fresh = run_git(
            &self.config.repo_root,
            &[
                "worktree",
                "add",
                &path_str,
                "-b",
                &branch,
                &self.config.integration_branch,
            ],
        )
        .await;

        if let Err(e) = fresh {
            // The branch survives when a previous run's worktree directory
            // was pruned; attach to it instead of forking a new one
            if !e.to_string().contains("already exists") {
                return Err(WorktreeError::CreateFailed(e.to_string()));
            }
            debug!(%branch, "WorktreeManager::create: branch exists, attaching worktree");
            run_git(&self.config.repo_root, &["worktree", "add", &path_str, &branch])
                .await
                .map_err(|e| WorktreeError::CreateFailed(e.to_string()))?;
        }

        info!(%run_id, worker_num, path = %path.display(), %branch, "Created worker checkout");
        Ok(WorkerCheckout { worker_num, path, branch })
    }

    /// Stage everything and commit on the worker's branch.
    ///
    /// Returns the new commit id, or None when the tree is clean.
    pub async fn commit(&self, checkout: &Path, message: &str) -> Result<Option<String>, WorktreeError> {
        debug!(checkout = %checkout.display(), %message, "WorktreeManager::commit: called");
        let status = run_git(checkout, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            debug!("WorktreeManager::commit: nothing to commit");
            return Ok(None);
        }

        run_git(checkout, &["add", "-A"]).await?;
        run_git(checkout, &["commit", "-m", message]).await?;
        let commit = run_git(checkout, &["rev-parse", "HEAD"]).await?;
        info!(checkout = %checkout.display(), %commit, "Committed worker changes");
        Ok(Some(commit))
    }

    /// Recent commit (id, subject) pairs on a checkout, newest first
    pub async fn log_subjects(&self, checkout: &Path) -> Result<Vec<(String, String)>, WorktreeError> {
        if !checkout.exists() {
            return Err(WorktreeError::NotFound(checkout.display().to_string()));
        }
        let log = run_git(checkout, &["log", "-n", "500", "--format=%H%x09%s"]).await?;
        Ok(log
            .lines()
            .filter_map(|line| {
                line.split_once('\t')
                    .map(|(commit, subject)| (commit.to_string(), subject.to_string()))
            })
            .collect())
    }

    /// Files touched by a single commit
    pub async fn commit_files(&self, checkout: &Path, commit: &str) -> Result<Vec<String>, WorktreeError> {
        let output = run_git(checkout, &["diff-tree", "--no-commit-id", "--name-only", "-r", commit]).await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Remove a worker's worktree and delete its branch
    pub async fn remove(&self, run_id: &str, worker_num: i64) -> Result<(), WorktreeError> {
        debug!(%run_id, worker_num, "WorktreeManager::remove: called");
        let path = self.checkout_path(run_id, worker_num);

        if path.exists() {
            let path_str = path.display().to_string();
            let result = run_git(&self.config.repo_root, &["worktree", "remove", &path_str, "--force"]).await;
            if let Err(e) = result {
                // Already detached worktrees are fine to ignore
                if !e.to_string().contains("is not a working tree") {
                    return Err(WorktreeError::RemoveFailed(e.to_string()));
                }
            }
        } else {
            warn!(path = %path.display(), "Worker checkout does not exist, skipping removal");
        }

        let branch = self.branch_name(run_id, worker_num);
        let _ = run_git(&self.config.repo_root, &["branch", "-D", &branch]).await;

        info!(%run_id, worker_num, "Removed worker checkout");
        Ok(())
    }
}
