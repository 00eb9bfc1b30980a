//! # Task: routed work unit
//!
//! ## Responsibility
//! Define task identity, priority, lifecycle state, the submission shape
//! (also loadable from TOML task files) and the outcome an agent reports.
//!
//! ## Guarantees
//! - Ordered: priorities compare `Low < Normal < High < Critical`
//! - Versioned: every assignment and requeue bumps [`Task::generation`],
//!   so results from an earlier attempt can be told apart
//! - Serializable: submissions and views round-trip through serde
//!
//! ## NOT Responsible For
//! - Queueing and assignment (see: router.rs)

use crate::agent::{AgentId, AgentType, CapabilitySet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique task identifier, generated on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(
    /// The raw identifier, e.g. `"task-5f0c…"`.
    pub String,
);

impl TaskId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4().simple()))
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task priority levels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background / batch work.
    Low = 0,
    /// Standard priority for most tasks.
    #[default]
    Normal = 1,
    /// Elevated priority, assigned before `Normal`.
    High = 2,
    /// Assigned ahead of all others.
    Critical = 3,
}

impl Priority {
    /// Lowercase name used in config, labels and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Parse a priority level from `"low"`, `"normal"`, `"high"` or `"critical"`.
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Lifecycle state of a task.
///
/// `Queued` → `Assigned` → `Running` → `Succeeded` | `Failed`, with a
/// failed attempt under the retry budget going back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for an eligible agent.
    Queued,
    /// Bound to an agent, dispatch not yet acknowledged.
    Assigned,
    /// The agent accepted the dispatch.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed permanently.
    Failed,
}

impl TaskState {
    /// Returns `true` if the task holds an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Returns `true` if the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A task submission.
///
/// # Example
///
/// ```rust
/// use tokio_fleet_coordinator::task::{Priority, TaskSpec};
/// let spec = TaskSpec::new(["security_scan"])
///     .with_priority(Priority::High)
///     .with_payload(serde_json::json!({"code": "eval(x)"}));
/// assert_eq!(spec.priority, Priority::High);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Tags an agent must offer to take this task.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Opaque payload forwarded to the agent.
    #[serde(default)]
    pub payload: Value,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Restrict to one role. When absent the role is inferred from the tags.
    #[serde(default)]
    pub agent_type: Option<AgentType>,
    /// Per-attempt deadline override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    /// A `Normal` priority submission with a null payload.
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: crate::agent::capability_set(capabilities),
            payload: Value::Null,
            priority: Priority::Normal,
            agent_type: None,
            timeout_secs: None,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Restrict the task to a single role.
    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    /// Override the per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }
}

/// A batch of submissions in TOML form.
///
/// ```toml
/// [[tasks]]
/// capabilities = ["security_scan"]
/// priority = "high"
/// payload = { code = "eval(user_input)" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskFile {
    /// Submissions in file order.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl TaskFile {
    /// Parse a task file from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FleetError::Other`] with the parser message on
    /// malformed input.
    pub fn from_toml(content: &str) -> Result<Self, crate::FleetError> {
        toml::from_str(content).map_err(|e| crate::FleetError::Other(format!("task file: {e}")))
    }
}

/// What an agent reports for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The attempt succeeded with a result value.
    Success(Value),
    /// The attempt failed for a task-level reason.
    Failure(String),
}

/// The router's record of one task.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique task id.
    pub id: TaskId,
    /// Tags an agent must offer.
    pub required: CapabilitySet,
    /// Opaque payload.
    pub payload: Value,
    /// Scheduling priority.
    pub priority: Priority,
    /// Explicit role restriction.
    pub agent_type: Option<AgentType>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Agent currently holding the task.
    pub assigned_agent: Option<AgentId>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Deadline of the current attempt.
    pub deadline: Option<Instant>,
    /// Bumped on every assignment and requeue.
    pub generation: u64,
    /// Submission order, FIFO tie-break within a priority.
    pub sequence: u64,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Submission instant.
    pub submitted_at: Instant,
    /// When the task reached a terminal state.
    pub finished_at: Option<Instant>,
    /// Reason attached to the latest failure.
    pub last_failure: Option<String>,
    /// Result of the successful attempt.
    pub result: Option<Value>,
    /// Agents that already failed this task, oldest first.
    pub failed_agents: Vec<AgentId>,
}

impl Task {
    /// Build a queued task from a submission.
    pub fn from_spec(
        id: TaskId,
        spec: TaskSpec,
        sequence: u64,
        default_timeout: Duration,
        now: Instant,
    ) -> Self {
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            id,
            required: spec.capabilities,
            payload: spec.payload,
            priority: spec.priority,
            agent_type: spec.agent_type,
            state: TaskState::Queued,
            assigned_agent: None,
            retry_count: 0,
            deadline: None,
            generation: 0,
            sequence,
            timeout,
            submitted_at: now,
            finished_at: None,
            last_failure: None,
            result: None,
            failed_agents: Vec::new(),
        }
    }

    /// The role used for scaling decisions: explicit, else inferred.
    pub fn scaling_type(&self) -> Option<AgentType> {
        self.agent_type.or_else(|| AgentType::infer(&self.required))
    }

    /// Serializable view of this record.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            capabilities: self.required.iter().cloned().collect(),
            priority: self.priority,
            agent_type: self.scaling_type(),
            state: self.state,
            assigned_agent: self.assigned_agent.clone(),
            retry_count: self.retry_count,
            generation: self.generation,
            last_failure: self.last_failure.clone(),
            result: self.result.clone(),
        }
    }
}

/// Point-in-time, serializable view of a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    /// Unique task id.
    pub id: TaskId,
    /// Required tags, sorted.
    pub capabilities: Vec<String>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Scaling role, explicit or inferred.
    pub agent_type: Option<AgentType>,
    /// Lifecycle state.
    pub state: TaskState,
    /// Agent holding the task.
    pub assigned_agent: Option<AgentId>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempt generation.
    pub generation: u64,
    /// Latest failure reason.
    pub last_failure: Option<String>,
    /// Result value on success.
    pub result: Option<Value>,
}
