//! Worker runtime: assignment polling, agent invocation, heartbeats

mod agent;
mod events;
mod heartbeat;
mod runner;

pub use agent::{AgentError, AgentExecution, AgentInvocation, AgentOutcome, task_log_path};
pub use events::{AgentEvent, StreamTotals};
pub use heartbeat::{HeartbeatHandle, spawn_heartbeat};
pub use runner::{WorkerContext, build_agent_prompt, run_worker};
