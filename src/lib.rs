//! # tokio-fleet-coordinator
//!
//! Coordination core for a large fleet of agent instances over Tokio.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────── FleetCoordinator ────────────────┐
//! register ─────► │ AgentRegistry ◄── HealthMonitor (probe cadence)  │
//! heartbeat ────► │      ▲    │                                      │
//!                 │      │    └── HealthEvent ──► EventWindow        │
//! submit ───────► │ TaskRouter ── CapacityExhausted ──► ScaleController ──► ScaleIntentSink
//! report ───────► │      │                                           │
//!                 │      └── Assignment ──► AgentEndpoint::execute_task
//!                 └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: agent roles, lifecycle states, the agent record
//! - [`task`]: task ids, priorities, states, submissions, outcomes
//! - [`registry`]: [`registry::AgentRegistry`], single source of truth for agents
//! - [`monitor`]: [`monitor::HealthMonitor`], cadence probes and failure detection
//! - [`router`]: [`router::TaskRouter`], priority queue, assignment, retries, backpressure
//! - [`scale`]: [`scale::ScaleController`], per-type scale decisions with cooldown
//! - [`coordinator`]: [`coordinator::FleetCoordinator`], composition and background loops
//! - [`endpoint`]: the agent execution endpoint contract
//! - [`events`]: health events and their rolling window
//! - [`stats`]: aggregation cache rebuilt from snapshots
//! - [`metrics`]: Prometheus counters and gauges
//! - [`config`]: TOML configuration, loading and validation
//! - [`retry`]: local retry policy for transient probe and dispatch faults

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod router;
pub mod scale;
pub mod stats;
pub mod task;

// Re-exports for convenience
pub use agent::{AgentId, AgentState, AgentType, CapabilitySet};
pub use config::FleetConfig;
pub use coordinator::{CoordinatorHandle, FleetCoordinator, FleetSnapshot};
pub use endpoint::{AgentEndpoint, HealthStatus, SimulatedEndpoint};
pub use scale::{ScaleIntent, ScaleReason};
pub use task::{Priority, TaskId, TaskOutcome, TaskSpec, TaskState};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`FleetError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), FleetError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| FleetError::Other(format!("tracing init failed: {e}")))
}

/// Top-level coordinator errors.
///
/// All variants implement `std::error::Error` via [`thiserror`]. Only
/// invariant violations are fatal to the process; every variant here is
/// scoped to a single agent, task or request.
#[derive(Error, Debug)]
pub enum FleetError {
    /// An agent with this id is already registered and not removed.
    #[error("agent already registered: {agent_id}")]
    DuplicateId {
        /// The conflicting agent id.
        agent_id: AgentId,
    },

    /// The agent id is not known to the registry.
    #[error("unknown agent: {agent_id}")]
    UnknownAgent {
        /// The agent id that was looked up.
        agent_id: AgentId,
    },

    /// The task id is not tracked by the router.
    #[error("unknown task: {task_id}")]
    UnknownTask {
        /// The task id that was looked up.
        task_id: TaskId,
    },

    /// No eligible agents for a set of capability tags. A signal, not fatal.
    #[error("capacity exhausted for tags [{tags}]")]
    CapacityExhausted {
        /// Comma-joined capability tags that found no agent.
        tags: String,
    },

    /// Lost a race to claim a task or an agent. The caller may retry.
    #[error("assignment conflict: task {task_id} / agent {agent_id}")]
    AssignmentConflict {
        /// Task involved in the race.
        task_id: TaskId,
        /// Agent involved in the race.
        agent_id: AgentId,
    },

    /// Probe or dispatch transport failure. Treated as an agent fault.
    #[error("infrastructure failure on {agent_id}: {reason}")]
    InfrastructureFailure {
        /// Agent whose endpoint failed.
        agent_id: AgentId,
        /// Transport-level reason.
        reason: String,
    },

    /// The task queue reached its configured bound.
    #[error("task queue full ({capacity} queued)")]
    QueueFull {
        /// The configured queue bound.
        capacity: usize,
    },

    /// A submission was rejected before it reached the queue.
    #[error("invalid task: {reason}")]
    InvalidTask {
        /// Which field was out of range.
        reason: String,
    },

    /// A configuration value is missing or invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] config::validation::ConfigError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_display_names_agent() {
        let err = FleetError::DuplicateId {
            agent_id: AgentId::new("qm-1"),
        };
        assert!(err.to_string().contains("qm-1"));
    }

    #[test]
    fn test_assignment_conflict_display_names_both_sides() {
        let err = FleetError::AssignmentConflict {
            task_id: TaskId::new("task-7"),
            agent_id: AgentId::new("agent-3"),
        };
        let msg = err.to_string();
        assert!(msg.contains("task-7"));
        assert!(msg.contains("agent-3"));
    }

    #[test]
    fn test_infrastructure_failure_display_includes_reason() {
        let err = FleetError::InfrastructureFailure {
            agent_id: AgentId::new("agent-1"),
            reason: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_queue_full_display_includes_capacity() {
        let err = FleetError::QueueFull { capacity: 10 };
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_invalid_task_display_includes_reason() {
        let err = FleetError::InvalidTask {
            reason: "timeout_secs too large".to_string(),
        };
        assert!(err.to_string().contains("timeout_secs too large"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
