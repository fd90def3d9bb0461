//! Source-tree management: per-worker checkouts, merge, and extract

mod manager;
mod merge;

pub use manager::{WorkerCheckout, WorktreeConfig, WorktreeError, WorktreeManager};
pub use merge::{ConflictRecord, MergeOutcome, PROJECT_MARKER, extract, merge_worker_branches};
