//! RalphSwarm configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level when no --log-level flag is given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// LLM provider configuration (task analysis and file prediction)
    pub llm: LlmConfig,

    /// Swarm sizing, timeouts, and agent invocation
    pub swarm: SwarmConfig,

    /// Git configuration
    pub git: GitConfig,

    /// Storage roots
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".ralphswarm.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ralphswarm").join("ralphswarm.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Peek the configured log level before full logging is initialized
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|config| config.log_level)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
            timeout_ms: 120_000,
        }
    }
}

/// Swarm sizing, timeouts, and agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Default worker count per run
    pub workers: i64,

    /// Hard cap on workers for a single run
    #[serde(rename = "max-workers-per-run")]
    pub max_workers_per_run: i64,

    /// Hard cap on workers across all runs on this installation
    #[serde(rename = "max-workers-global")]
    pub max_workers_global: i64,

    /// Per-task agent timeout in seconds
    #[serde(rename = "task-timeout-secs")]
    pub task_timeout_secs: u64,

    /// Worker heartbeat period in seconds
    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,

    /// Heartbeat age after which a worker counts as stale, in seconds
    #[serde(rename = "stale-threshold-secs")]
    pub stale_threshold_secs: u64,

    /// Scheduler and worker poll interval in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Attempts before a retryable failure becomes terminal
    #[serde(rename = "max-attempts")]
    pub max_attempts: i64,

    /// Upper bound on the prompt handed to the agent, in bytes
    #[serde(rename = "prompt-byte-cap")]
    pub prompt_byte_cap: usize,

    /// Agent CLI executable
    #[serde(rename = "agent-command")]
    pub agent_command: String,

    /// Arguments passed to the agent CLI
    #[serde(rename = "agent-args")]
    pub agent_args: Vec<String>,

    /// Sentinel the agent must emit on success
    #[serde(rename = "completion-promise")]
    pub completion_promise: String,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_workers_per_run: 8,
            max_workers_global: 16,
            task_timeout_secs: 900,
            heartbeat_secs: 5,
            stale_threshold_secs: 30,
            poll_interval_ms: 500,
            max_attempts: 3,
            prompt_byte_cap: 256 * 1024,
            agent_command: "claude".to_string(),
            agent_args: vec!["-p".to_string(), "--output-format".to_string(), "stream-json".to_string()],
            completion_promise: "<promise>COMPLETE</promise>".to_string(),
        }
    }
}

impl SwarmConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Git configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Branch worker results integrate into; the base head is renamed to
    /// this if it differs
    #[serde(rename = "integration-branch")]
    pub integration_branch: String,

    /// Prefix for worker branches: <prefix>/<run_id>/worker-<n>
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            integration_branch: "main".to_string(),
            branch_prefix: "swarm".to_string(),
        }
    }
}

/// Storage roots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for the store file and per-run state
    #[serde(rename = "state-root")]
    pub state_root: Option<PathBuf>,

    /// Root for published projects
    #[serde(rename = "projects-root")]
    pub projects_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_root: None,
            projects_root: None,
        }
    }
}

impl StorageConfig {
    /// Resolved state root: config > RALPHSWARM_STATE_ROOT > data dir
    pub fn state_root(&self) -> PathBuf {
        if let Some(root) = &self.state_root {
            return root.clone();
        }
        if let Ok(root) = std::env::var("RALPHSWARM_STATE_ROOT") {
            return PathBuf::from(root);
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ralphswarm")
    }

    /// Resolved projects root: config > RALPHSWARM_PROJECTS_ROOT > state root
    pub fn projects_root(&self) -> PathBuf {
        if let Some(root) = &self.projects_root {
            return root.clone();
        }
        if let Ok(root) = std::env::var("RALPHSWARM_PROJECTS_ROOT") {
            return PathBuf::from(root);
        }
        self.state_root().join("projects")
    }

    /// The coordination store file
    pub fn store_path(&self) -> PathBuf {
        self.state_root().join("swarm.db")
    }

    /// Per-run state directory
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.state_root().join(run_id)
    }

    /// A worker's checkout directory
    pub fn worker_repo_dir(&self, run_id: &str, worker_num: i64) -> PathBuf {
        self.run_dir(run_id).join(format!("worker-{worker_num}")).join("repo")
    }

    /// A worker's log directory
    pub fn worker_logs_dir(&self, run_id: &str, worker_num: i64) -> PathBuf {
        self.run_dir(run_id).join(format!("worker-{worker_num}")).join("logs")
    }
}
