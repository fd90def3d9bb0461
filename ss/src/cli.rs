//! CLI definitions for the read-only store inspector

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect a swarm coordination store without blocking its writer
#[derive(Parser)]
#[command(name = "swarmstore", about = "Read-only swarm coordination store inspector", version = env!("GIT_DESCRIBE"))]
pub struct Cli {
    /// Path to the store file (default: <state-root>/swarm.db)
    #[arg(short, long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List all runs
    Runs,

    /// List tasks for a run
    Tasks {
        /// Run id (or unique prefix)
        run_id: String,
    },

    /// List workers for a run
    Workers {
        /// Run id (or unique prefix)
        run_id: String,
    },

    /// Show aggregate task counts for a run
    Stats {
        /// Run id (or unique prefix)
        run_id: String,
    },

    /// List currently held file locks for a run
    Locks {
        /// Run id (or unique prefix)
        run_id: String,
    },
}

/// Default store location under the state root
pub fn default_store_path() -> PathBuf {
    std::env::var("RALPHSWARM_STATE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ralphswarm")
        })
        .join("swarm.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_runs() {
        let cli = Cli::parse_from(["swarmstore", "runs"]);
        assert!(matches!(cli.command, Command::Runs));
    }

    #[test]
    fn test_cli_parse_tasks_with_store() {
        let cli = Cli::parse_from(["swarmstore", "-s", "/tmp/swarm.db", "tasks", "abc123"]);
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/swarm.db")));
        assert!(matches!(cli.command, Command::Tasks { run_id } if run_id == "abc123"));
    }

    #[test]
    fn test_default_store_path_ends_with_db() {
        assert!(default_store_path().ends_with("swarm.db"));
    }
}
