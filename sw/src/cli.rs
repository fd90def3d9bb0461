//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// RalphSwarm - parallel coding-agent swarm orchestrator
#[derive(Parser)]
#[command(
    name = "swarm",
    about = "Decompose a devplan into tasks and execute them with parallel coding agents",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a devplan with a swarm of workers
    Plan {
        /// Path to the plan file
        plan: PathBuf,

        /// Number of workers
        #[arg(short, long)]
        workers: Option<i64>,

        /// Per-task agent timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Decompose a free-text prompt into tasks and execute them
    Prompt {
        /// What to build
        prompt: String,

        /// Number of workers
        #[arg(short, long)]
        workers: Option<i64>,
    },

    /// Parse a plan and print the computed tasks without executing
    Analyze {
        /// Path to the plan file
        plan: PathBuf,
    },

    /// Resume a previous run: retry failed tasks, continue pending ones
    Resume {
        /// Run id (or unique prefix)
        run_id: String,

        /// Number of workers
        #[arg(short, long)]
        workers: Option<i64>,
    },

    /// Gracefully stop the active run
    Stop,

    /// Forcibly kill all worker and agent processes of the active run
    EmergencyStop,

    /// Show the active run's aggregates and worker table (read-only)
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format for the status command
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => Err(format!("Unknown format: {}. Use: text, json, or table", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_plan() {
        let cli = Cli::parse_from(["swarm", "plan", "devplan.md", "--workers", "4", "--timeout", "300"]);
        if let Command::Plan { plan, workers, timeout } = cli.command {
            assert_eq!(plan, PathBuf::from("devplan.md"));
            assert_eq!(workers, Some(4));
            assert_eq!(timeout, Some(300));
        } else {
            panic!("Expected Plan command");
        }
    }

    #[test]
    fn test_cli_parse_prompt() {
        let cli = Cli::parse_from(["swarm", "prompt", "build a todo app"]);
        if let Command::Prompt { prompt, workers } = cli.command {
            assert_eq!(prompt, "build a todo app");
            assert!(workers.is_none());
        } else {
            panic!("Expected Prompt command");
        }
    }

    #[test]
    fn test_cli_parse_analyze() {
        let cli = Cli::parse_from(["swarm", "analyze", "devplan.md"]);
        assert!(matches!(cli.command, Command::Analyze { .. }));
    }

    #[test]
    fn test_cli_parse_resume() {
        let cli = Cli::parse_from(["swarm", "resume", "0193abc"]);
        assert!(matches!(cli.command, Command::Resume { run_id, .. } if run_id == "0193abc"));
    }

    #[test]
    fn test_cli_parse_stop_variants() {
        assert!(matches!(Cli::parse_from(["swarm", "stop"]).command, Command::Stop));
        assert!(matches!(
            Cli::parse_from(["swarm", "emergency-stop"]).command,
            Command::EmergencyStop
        ));
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["swarm", "-c", "/path/to/config.yml", "status"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!(matches!("table".parse::<OutputFormat>(), Ok(OutputFormat::Table)));
        assert!("invalid".parse::<OutputFormat>().is_err());
    }
}
