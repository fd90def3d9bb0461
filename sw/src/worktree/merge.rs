//! Merging worker branches and publishing the result
//!
//! Worker branches integrate sequentially into the integration head. A
//! content conflict is not a failure: the conflicted state (markers and
//! all) is committed and the contributing files recorded, because surfacing
//! both contributions is the contract. Only when git cannot merge at all
//! does a per-file overlay reconstruct the union with explicit markers.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Marker file written at the root of a published project
pub const PROJECT_MARKER: &str = ".ralph-swarm.json";

/// One file that ended up with conflict markers during merge
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConflictRecord {
    /// Repo-relative path
    pub file: String,

    /// The worker branch whose contribution conflicted with the
    /// already-integrated side
    pub branch: String,
}

/// Result of merging all worker branches
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Branches whose commits are now on the integration head
    pub merged: Vec<String>,

    /// Files carrying conflict markers, with the branch that caused them
    pub conflicts: Vec<ConflictRecord>,
}

async fn git(repo: &Path, args: &[&str]) -> Result<(bool, String, String)> {
    debug!(?args, "merge git: called");
    let output = Command::new("git").args(args).current_dir(repo).output().await?;
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}

async fn git_ok(repo: &Path, args: &[&str]) -> Result<String> {
    let (ok, stdout, stderr) = git(repo, args).await?;
    if !ok {
        eyre::bail!("git {}: {}", args.join(" "), stderr);
    }
    Ok(stdout)
}

/// Sequentially integrate worker branches into the integration head.
///
/// Never aborts the run for content conflicts; the outcome records them.
pub async fn merge_worker_branches(
    repo_root: &Path,
    integration_branch: &str,
    branches: &[String],
) -> Result<MergeOutcome> {
    info!(count = branches.len(), "Merging worker branches");
    let mut outcome = MergeOutcome::default();

    git_ok(repo_root, &["checkout", integration_branch])
        .await
        .context("Failed to check out the integration branch")?;

    for branch in branches {
        // Branches that never diverged have nothing to contribute
        let (exists, _, _) = git(repo_root, &["rev-parse", "--verify", branch]).await?;
        if !exists {
            warn!(%branch, "Worker branch does not exist, skipping");
            continue;
        }
        let ahead = git_ok(repo_root, &["rev-list", "--count", &format!("{integration_branch}..{branch}")]).await?;
        if ahead == "0" {
            debug!(%branch, "Branch has no new commits, skipping merge");
            continue;
        }

        let message = format!("Merge {branch}");
        let (merged, _, stderr) = git(repo_root, &["merge", "--no-ff", branch, "-m", &message]).await?;
        if merged {
            info!(%branch, "Merged cleanly");
            outcome.merged.push(branch.clone());
            continue;
        }

        let conflicted = git_ok(repo_root, &["diff", "--name-only", "--diff-filter=U"]).await?;
        if !conflicted.is_empty() {
            // Keep both contributions: commit the markers as-is
            for file in conflicted.lines() {
                warn!(%branch, file, "Merge conflict kept as markers");
                outcome.conflicts.push(ConflictRecord {
                    file: file.to_string(),
                    branch: branch.clone(),
                });
            }
            git_ok(repo_root, &["add", "-A"]).await?;
            git_ok(
                repo_root,
                &["commit", "-m", &format!("Merge {branch} (conflict markers kept)")],
            )
            .await?;
            outcome.merged.push(branch.clone());
            continue;
        }

        // The merge failed outright (not a content conflict); fall back to
        // an overlay of the branch's files with explicit markers
        warn!(%branch, %stderr, "Native merge failed, applying overlay fallback");
        git(repo_root, &["merge", "--abort"]).await?;
        let overlaid = overlay_branch(repo_root, integration_branch, branch).await?;
        outcome.conflicts.extend(overlaid);
        outcome.merged.push(branch.clone());
    }

    Ok(outcome)
}

/// Per-file overlay fallback: union of the integration version and the
/// branch version, wrapped in conflict markers when they differ.
async fn overlay_branch(repo_root: &Path, integration_branch: &str, branch: &str) -> Result<Vec<ConflictRecord>> {
    debug!(%branch, "overlay_branch: called");
    let mut conflicts = Vec::new();

    let files = match git(repo_root, &["merge-base", "HEAD", branch]).await? {
        (true, base, _) => git_ok(repo_root, &["diff", "--name-only", &base, branch]).await?,
        // Unrelated histories: every file on the branch is a change
        (false, _, _) => git_ok(repo_root, &["ls-tree", "-r", "--name-only", branch]).await?,
    };

    for file in files.lines() {
        let (ok, theirs, _) = git(repo_root, &["show", &format!("{branch}:{file}")]).await?;
        if !ok {
            // Deleted on the branch; leave the integration version in place
            continue;
        }

        let target = repo_root.join(file);
        let ours = std::fs::read_to_string(&target).unwrap_or_default();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if ours == theirs {
            continue;
        }
        if ours.is_empty() {
            std::fs::write(&target, &theirs)?;
            continue;
        }

        let merged = format!("<<<<<<< {integration_branch}\n{ours}=======\n{theirs}>>>>>>> {branch}\n");
        std::fs::write(&target, merged)?;
        warn!(%branch, file, "Overlay produced conflict markers");
        conflicts.push(ConflictRecord {
            file: file.to_string(),
            branch: branch.to_string(),
        });
    }

    git_ok(repo_root, &["add", "-A"]).await?;
    git(
        repo_root,
        &["commit", "-m", &format!("Overlay {branch} (conflict markers kept)")],
    )
    .await?;

    Ok(conflicts)
}

/// Copy the merged tree (minus git internals) to the published project
/// directory and write the project marker file.
pub async fn extract(repo_root: &Path, destination: &Path, run_id: &str) -> Result<PathBuf> {
    info!(from = %repo_root.display(), to = %destination.display(), "Extracting published project");
    std::fs::create_dir_all(destination)?;

    for entry in WalkDir::new(repo_root)
        .into_iter()
        .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
        .filter_map(|e| e.ok())
    {
        let relative = entry.path().strip_prefix(repo_root)?;
        if relative.as_os_str().is_empty() || relative == Path::new(PROJECT_MARKER) {
            continue;
        }
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }

    let marker = serde_json::json!({
        "run_id": run_id,
        "published_at": swarmstore::now_ms(),
    });
    std::fs::write(destination.join(PROJECT_MARKER), serde_json::to_string_pretty(&marker)?)
        .context("Failed to write project marker")?;

    Ok(destination.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    async fn commit_file(dir: &Path, file: &str, content: &str, message: &str) {
        std::fs::write(dir.join(file), content).unwrap();
        git_ok(dir, &["add", "-A"]).await.unwrap();
        git_ok(dir, &["commit", "-m", message]).await.unwrap();
    }

    async fn branch_from_main(dir: &Path, name: &str) {
        git_ok(dir, &["checkout", "-b", name, "main"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_disjoint_branches_cleanly() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        branch_from_main(repo.path(), "swarm/r/worker-1").await;
        commit_file(repo.path(), "a.txt", "from one\n", "worker one").await;
        branch_from_main(repo.path(), "swarm/r/worker-2").await;
        commit_file(repo.path(), "b.txt", "from two\n", "worker two").await;

        let outcome = merge_worker_branches(
            repo.path(),
            "main",
            &["swarm/r/worker-1".to_string(), "swarm/r/worker-2".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(outcome.merged.len(), 2);
        assert!(outcome.conflicts.is_empty());
        assert!(repo.path().join("a.txt").exists());
        assert!(repo.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_merge_conflict_keeps_markers_and_records_file() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        commit_file(repo.path(), "conflict.txt", "base\n", "base file").await;

        branch_from_main(repo.path(), "swarm/r/worker-1").await;
        commit_file(repo.path(), "conflict.txt", "from one\n", "worker one").await;
        branch_from_main(repo.path(), "swarm/r/worker-2").await;
        commit_file(repo.path(), "conflict.txt", "from two\n", "worker two").await;

        let outcome = merge_worker_branches(
            repo.path(),
            "main",
            &["swarm/r/worker-1".to_string(), "swarm/r/worker-2".to_string()],
        )
        .await
        .unwrap();

        // Both branches land; the second records a conflict
        assert_eq!(outcome.merged.len(), 2);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].file, "conflict.txt");
        assert_eq!(outcome.conflicts[0].branch, "swarm/r/worker-2");

        let content = std::fs::read_to_string(repo.path().join("conflict.txt")).unwrap();
        assert!(content.contains("<<<<<<<"));
        assert!(content.contains("from one"));
        assert!(content.contains("from two"));
        assert!(content.contains(">>>>>>>"));

        // The conflicted state is committed, not left dangling
        let status = git_ok(repo.path(), &["status", "--porcelain"]).await.unwrap();
        assert!(status.is_empty());
    }

    #[tokio::test]
    async fn test_merge_skips_branch_without_commits() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        branch_from_main(repo.path(), "swarm/r/worker-1").await;
        git_ok(repo.path(), &["checkout", "main"]).await.unwrap();

        let outcome = merge_worker_branches(repo.path(), "main", &["swarm/r/worker-1".to_string()])
            .await
            .unwrap();
        assert!(outcome.merged.is_empty());
        assert!(outcome.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_merge_skips_missing_branch() {
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;

        let outcome = merge_worker_branches(repo.path(), "main", &["swarm/r/worker-9".to_string()])
            .await
            .unwrap();
        assert!(outcome.merged.is_empty());
    }

    #[tokio::test]
    async fn test_extract_copies_tree_and_writes_marker() {
        let repo = tempdir().unwrap();
        let dest_root = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        commit_file(repo.path(), "src.txt", "content\n", "add src").await;
        std::fs::create_dir_all(repo.path().join("nested")).unwrap();
        commit_file(repo.path(), "nested/deep.txt", "deep\n", "add nested").await;

        let dest = dest_root.path().join("my-project");
        extract(repo.path(), &dest, "run-42").await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("src.txt")).unwrap(), "content\n");
        assert_eq!(std::fs::read_to_string(dest.join("nested/deep.txt")).unwrap(), "deep\n");
        assert!(!dest.join(".git").exists());

        let marker: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dest.join(PROJECT_MARKER)).unwrap()).unwrap();
        assert_eq!(marker["run_id"], "run-42");
    }
}
