//! # Agent: fleet roles and lifecycle
//!
//! ## Responsibility
//! Define the closed set of agent roles, their default capability sets,
//! the lifecycle state machine, and the agent record owned by the
//! registry.
//!
//! ## Guarantees
//! - Closed: roles are an enum, not a class hierarchy; every role satisfies
//!   the same endpoint contract (see: endpoint.rs)
//! - Checked: [`AgentState::can_transition_to`] is the single transition table
//! - Serializable: roles and states round-trip through serde as snake_case
//!
//! ## NOT Responsible For
//! - Concurrency control (see: registry.rs)
//! - Probing (see: monitor.rs)

use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::time::Instant;

/// Unordered set of capability tags.
///
/// Backed by a `BTreeSet` so that two equal sets hash, compare and print
/// identically regardless of insertion order.
pub type CapabilitySet = BTreeSet<String>;

/// Build a [`CapabilitySet`] from any iterator of string-like tags.
///
/// # Example
///
/// ```rust
/// use tokio_fleet_coordinator::agent::capability_set;
/// let tags = capability_set(["quantum", "relativity", "quantum"]);
/// assert_eq!(tags.len(), 2);
/// ```
pub fn capability_set<I, S>(tags: I) -> CapabilitySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

/// Unique agent identifier, supplied by the agent at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(
    /// The raw identifier, e.g. `"code_review-1a2b3c4d"`.
    pub String,
);

impl AgentId {
    /// Create a new [`AgentId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Returned when a role name does not match any [`AgentType`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown agent type: {name}. Available types: {available}")]
pub struct UnknownAgentType {
    /// The name that failed to parse.
    pub name: String,
    /// Comma-separated list of valid role names.
    pub available: String,
}

/// Fleet roles. Each role has a fixed default capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Quantum mechanics calculations.
    QuantumMechanics,
    /// Special and general relativity calculations.
    Relativity,
    /// Cosmological models and observations.
    Cosmology,
    /// Static review of source code.
    CodeReview,
    /// Test generation and execution.
    Testing,
    /// Literature and trend research.
    Research,
    /// Documentation generation.
    Documentation,
    /// Service health and log monitoring.
    Monitoring,
    /// API connectors and data pipelines.
    Integration,
    /// Metrics aggregation and prediction.
    Analytics,
    /// Builds, rollouts and rollbacks.
    Deployment,
}

impl AgentType {
    /// Every role, in declaration order.
    pub const ALL: [AgentType; 11] = [
        AgentType::QuantumMechanics,
        AgentType::Relativity,
        AgentType::Cosmology,
        AgentType::CodeReview,
        AgentType::Testing,
        AgentType::Research,
        AgentType::Documentation,
        AgentType::Monitoring,
        AgentType::Integration,
        AgentType::Analytics,
        AgentType::Deployment,
    ];

    /// The snake_case role name used in config files, labels and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuantumMechanics => "quantum_mechanics",
            Self::Relativity => "relativity",
            Self::Cosmology => "cosmology",
            Self::CodeReview => "code_review",
            Self::Testing => "testing",
            Self::Research => "research",
            Self::Documentation => "documentation",
            Self::Monitoring => "monitoring",
            Self::Integration => "integration",
            Self::Analytics => "analytics",
            Self::Deployment => "deployment",
        }
    }

    /// Capabilities an agent of this role offers when it registers
    /// without an explicit capability list.
    pub fn default_capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::QuantumMechanics => &[
                "hydrogen_energy",
                "wave_function",
                "uncertainty",
                "harmonic_oscillator",
            ],
            Self::Relativity => &[
                "time_dilation",
                "length_contraction",
                "mass_energy",
                "spacetime_interval",
            ],
            Self::Cosmology => &["hubble_expansion", "cmb_analysis", "dark_matter", "redshift"],
            Self::CodeReview => &[
                "syntax_check",
                "style_analysis",
                "complexity_analysis",
                "security_scan",
                "best_practices",
            ],
            Self::Testing => &[
                "unit_test_generation",
                "integration_test",
                "load_test",
                "coverage_analysis",
                "test_execution",
            ],
            Self::Research => &[
                "literature_search",
                "paper_summary",
                "citation_analysis",
                "trend_analysis",
                "knowledge_extraction",
            ],
            Self::Documentation => &[
                "docstring_generation",
                "api_documentation",
                "readme_generation",
                "changelog_update",
                "tutorial_creation",
            ],
            Self::Monitoring => &[
                "health_monitoring",
                "performance_metrics",
                "log_analysis",
                "alert_management",
                "anomaly_detection",
            ],
            Self::Integration => &[
                "api_connector",
                "data_transformation",
                "webhook_management",
                "sync_orchestration",
                "schema_validation",
            ],
            Self::Analytics => &[
                "metrics_aggregation",
                "trend_prediction",
                "anomaly_scoring",
                "cohort_analysis",
                "funnel_analysis",
            ],
            Self::Deployment => &[
                "build_execution",
                "deployment_orchestration",
                "rollback_management",
                "canary_deployment",
                "environment_provisioning",
            ],
        }
    }

    /// The default capability set as an owned [`CapabilitySet`].
    pub fn default_capability_set(&self) -> CapabilitySet {
        capability_set(self.default_capabilities().iter().copied())
    }

    /// Returns `true` if this role's default capabilities cover every tag.
    pub fn covers(&self, tags: &CapabilitySet) -> bool {
        let defaults = self.default_capabilities();
        tags.iter().all(|t| defaults.contains(&t.as_str()))
    }

    /// Infer the role that serves a set of required tags.
    ///
    /// Returns the first role (in [`AgentType::ALL`] order) whose default
    /// capabilities cover the tags, or `None` for an empty set or tags
    /// that no single role covers.
    pub fn infer(tags: &CapabilitySet) -> Option<AgentType> {
        if tags.is_empty() {
            return None;
        }
        Self::ALL.iter().copied().find(|t| t.covers(tags))
    }

    /// Parse a role from its snake_case name, returning `None` if unknown.
    pub fn from_name(s: &str) -> Option<Self> {
        let lowered = s.trim().to_lowercase();
        Self::ALL.iter().copied().find(|t| t.as_str() == lowered)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = UnknownAgentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownAgentType {
            name: s.to_string(),
            available: Self::ALL
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Lifecycle state of an agent.
///
/// ```text
/// registering → idle ⇄ working
///                 ▲       │
///                 └── unhealthy ──► draining ──► removed
/// ```
///
/// `removed` is absorbing. The only backward edges are `working → idle`
/// (task finished) and `unhealthy → idle` (recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registration accepted, not yet eligible.
    Registering,
    /// Live and free to take a task.
    Idle,
    /// Live and holding exactly one task.
    Working,
    /// Missed too many heartbeats or reported a fault.
    Unhealthy,
    /// Finishing current work, takes no new tasks.
    Draining,
    /// Deregistered. Terminal.
    Removed,
}

impl AgentState {
    /// Returns `true` if the transition `self → to` is allowed.
    ///
    /// Self-transitions are not transitions and return `false`.
    pub fn can_transition_to(&self, to: AgentState) -> bool {
        use AgentState::*;
        match (self, to) {
            (Removed, _) => false,
            (_, Removed) => true,
            (Registering, Idle) => true,
            (Idle, Working) | (Working, Idle) => true,
            (Registering | Idle | Working, Unhealthy) => true,
            (Unhealthy, Idle) => true,
            (Registering | Idle | Working | Unhealthy, Draining) => true,
            _ => false,
        }
    }

    /// Returns `true` for every state except `removed`.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Removed)
    }

    /// Returns `true` if an agent in this state may be assigned a task.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registering => "registering",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Unhealthy => "unhealthy",
            Self::Draining => "draining",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// The registry's record of one agent instance.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Unique agent id.
    pub id: AgentId,
    /// Fleet role.
    pub agent_type: AgentType,
    /// Tags this agent can serve.
    pub capabilities: CapabilitySet,
    /// Current lifecycle state.
    pub state: AgentState,
    /// Last heartbeat or successful probe.
    pub last_heartbeat: Instant,
    /// When the agent registered.
    pub registered_at: Instant,
    /// Task currently held, if any.
    pub assigned_task: Option<TaskId>,
    /// Consecutive probe cycles without a heartbeat.
    pub missed_probes: u32,
    /// When the agent last entered `unhealthy`.
    pub unhealthy_since: Option<Instant>,
    /// When the agent entered `removed`.
    pub removed_at: Option<Instant>,
    /// Tasks this agent finished successfully.
    pub tasks_completed: u64,
    /// Tasks this agent finished with a failure.
    pub tasks_failed: u64,
}

impl Agent {
    /// Create a new record in the `registering` state.
    pub fn new(
        id: AgentId,
        agent_type: AgentType,
        capabilities: CapabilitySet,
        now: Instant,
    ) -> Self {
        Self {
            id,
            agent_type,
            capabilities,
            state: AgentState::Registering,
            last_heartbeat: now,
            registered_at: now,
            assigned_task: None,
            missed_probes: 0,
            unhealthy_since: None,
            removed_at: None,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Returns `true` if the capability set is a superset of `tags`.
    pub fn has_capabilities(&self, tags: &CapabilitySet) -> bool {
        tags.is_subset(&self.capabilities)
    }

    /// Percentage of finished tasks that succeeded. 100.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 100.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }

    /// Serializable view of this record relative to `now`.
    pub fn view(&self, now: Instant) -> AgentView {
        AgentView {
            id: self.id.clone(),
            agent_type: self.agent_type,
            capabilities: self.capabilities.iter().cloned().collect(),
            state: self.state,
            heartbeat_age_ms: now.saturating_duration_since(self.last_heartbeat).as_millis() as u64,
            uptime_secs: now.saturating_duration_since(self.registered_at).as_secs(),
            assigned_task: self.assigned_task.clone(),
            missed_probes: self.missed_probes,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            success_rate: self.success_rate(),
        }
    }
}

/// Point-in-time, serializable view of an [`Agent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentView {
    /// Unique agent id.
    pub id: AgentId,
    /// Fleet role.
    pub agent_type: AgentType,
    /// Capability tags, sorted.
    pub capabilities: Vec<String>,
    /// Lifecycle state.
    pub state: AgentState,
    /// Milliseconds since the last heartbeat.
    pub heartbeat_age_ms: u64,
    /// Seconds since registration.
    pub uptime_secs: u64,
    /// Task currently held, if any.
    pub assigned_task: Option<TaskId>,
    /// Consecutive missed probes.
    pub missed_probes: u32,
    /// Tasks finished successfully.
    pub tasks_completed: u64,
    /// Tasks finished with a failure.
    pub tasks_failed: u64,
    /// Success percentage.
    pub success_rate: f64,
}
