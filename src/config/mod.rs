//! # Fleet Configuration
//!
//! ## Responsibility
//! Define the TOML schema for the coordinator: probe cadence and failure
//! policy, routing and retry budgets, scale thresholds and replica bounds,
//! and coordinator loop settings.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `FleetConfig`
//! - Complete: every field has a documented default, so an empty file is valid
//! - Validated: semantic constraints are checked by [`validation::validate`]
//!
//! ## NOT Responsible For
//! - Reading files (that belongs to `loader`)
//! - Applying the values (each component reads its own section)
//!
//! ## Example
//!
//! ```toml
//! [health]
//! probe_interval_secs = 10
//! missed_threshold = 3
//!
//! [router]
//! max_retries = 3
//!
//! [scale]
//! cooldown_secs = 120
//!
//! [scale.bounds.code_review]
//! min = 2
//! max = 200
//! ```

pub mod loader;
pub mod validation;

use crate::agent::AgentType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

/// Default probe cadence: 10 seconds.
fn default_probe_interval_secs() -> u64 {
    10
}

/// Default consecutive misses before an agent is unhealthy.
fn default_missed_threshold() -> u32 {
    3
}

/// Default grace before an unhealthy agent is removed: 60 seconds.
fn default_unhealthy_grace_secs() -> u64 {
    60
}

/// Default per-probe timeout: 2000ms.
fn default_probe_timeout_ms() -> u64 {
    2000
}

/// Default local retries for a failed probe.
fn default_probe_retries() -> u32 {
    1
}

/// Default delay between probe retries: 100ms.
fn default_probe_retry_delay_ms() -> u64 {
    100
}

/// Default probe fan-out bound.
fn default_max_concurrent_probes() -> usize {
    256
}

/// Default failed attempts before a task fails permanently.
fn default_max_retries() -> u32 {
    3
}

/// Default per-attempt deadline: 300 seconds.
fn default_task_timeout_secs() -> u64 {
    300
}

/// Default ceiling on a submission's own deadline: 1 day.
fn default_max_task_timeout_secs() -> u64 {
    86_400
}

/// Default starvation period before a capacity signal: 30 seconds.
fn default_capacity_threshold_secs() -> u64 {
    30
}

/// Default queue bound.
fn default_max_queued() -> usize {
    100_000
}

/// Default assignments per scheduling pass.
fn default_max_assignments_per_cycle() -> usize {
    1024
}

/// Default retention of terminal task results: 1 hour.
fn default_result_ttl_secs() -> u64 {
    3600
}

/// Default scheduler tick: 200ms.
fn default_schedule_interval_ms() -> u64 {
    200
}

/// Default timeout sweep cadence: 5 seconds.
fn default_sweep_interval_secs() -> u64 {
    5
}

/// Default local retries for a failed dispatch.
fn default_dispatch_retries() -> u32 {
    2
}

/// Default delay before the first dispatch retry: 50ms, doubling after.
fn default_dispatch_retry_delay_ms() -> u64 {
    50
}

/// Default scale evaluation cadence: 15 seconds.
fn default_evaluation_interval_secs() -> u64 {
    15
}

/// Default cooldown after a scale decision: 120 seconds.
fn default_cooldown_secs() -> u64 {
    120
}

/// Default queued tasks per idle agent that counts as overload.
fn default_high_watermark() -> f64 {
    2.0
}

/// Default utilization below which a type counts as underused.
fn default_low_watermark() -> f64 {
    0.2
}

/// Default time a watermark must hold before acting: 60 seconds.
fn default_sustain_window_secs() -> u64 {
    60
}

/// Default step as a fraction of the current count.
fn default_step_ratio() -> f64 {
    0.25
}

/// Default largest single step.
fn default_max_step() -> u32 {
    50
}

/// Default unhealthy fraction that triggers replacement.
fn default_unhealthy_threshold() -> f64 {
    0.25
}

/// Default retained scale intents.
fn default_history_len() -> usize {
    256
}

/// Default maximum replicas per type.
fn default_max_replicas() -> u32 {
    1000
}

/// Default dispatch worker pool size.
fn default_dispatch_workers() -> usize {
    512
}

/// Default health event max age: 5 minutes.
fn default_event_window_secs() -> u64 {
    300
}

/// Default health event max count.
fn default_event_window_len() -> usize {
    10_000
}

/// Default stats refresh cadence: 5 seconds.
fn default_stats_interval_secs() -> u64 {
    5
}

/// Default retention of removed agent tombstones: 10 minutes.
fn default_removed_retention_secs() -> u64 {
    600
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a coordinator instance.
///
/// Every section is optional in TOML; missing sections take their defaults.
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    /// Probe cadence and failure policy.
    #[serde(default)]
    pub health: HealthConfig,
    /// Queueing, retries and backpressure.
    #[serde(default)]
    pub router: RouterConfig,
    /// Scale thresholds and replica bounds.
    #[serde(default)]
    pub scale: ScaleConfig,
    /// Loop cadence and worker pool.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

// ── Health ───────────────────────────────────────────────────────────────

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Seconds between probe cycles.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Consecutive missed probes before `unhealthy`.
    #[serde(default = "default_missed_threshold")]
    pub missed_threshold: u32,
    /// Seconds an agent may stay unhealthy before removal.
    #[serde(default = "default_unhealthy_grace_secs")]
    pub unhealthy_grace_secs: u64,
    /// Timeout for a single `health()` call, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Local retries after a failed probe.
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    /// Delay between probe retries, in milliseconds.
    #[serde(default = "default_probe_retry_delay_ms")]
    pub probe_retry_delay_ms: u64,
    /// Probes in flight at once.
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            missed_threshold: default_missed_threshold(),
            unhealthy_grace_secs: default_unhealthy_grace_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_retries: default_probe_retries(),
            probe_retry_delay_ms: default_probe_retry_delay_ms(),
            max_concurrent_probes: default_max_concurrent_probes(),
        }
    }
}

impl HealthConfig {
    /// Probe cadence.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Grace period before an unhealthy agent is removed.
    pub fn unhealthy_grace(&self) -> Duration {
        Duration::from_secs(self.unhealthy_grace_secs)
    }

    /// Per-probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Delay between probe retries.
    pub fn probe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.probe_retry_delay_ms)
    }
}

// ── Router ───────────────────────────────────────────────────────────────

/// Task router settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Failed attempts before a task fails permanently.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt deadline when the submission sets none, in seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
    /// Largest per-attempt deadline a submission may ask for, in seconds.
    #[serde(default = "default_max_task_timeout_secs")]
    pub max_task_timeout_secs: u64,
    /// Seconds a tag set may go unmatched before a capacity signal.
    #[serde(default = "default_capacity_threshold_secs")]
    pub capacity_threshold_secs: u64,
    /// Maximum queued tasks; submissions beyond it are rejected.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// Assignments made by one scheduling pass.
    #[serde(default = "default_max_assignments_per_cycle")]
    pub max_assignments_per_cycle: usize,
    /// Seconds a terminal task stays queryable.
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// Scheduler tick, in milliseconds.
    #[serde(default = "default_schedule_interval_ms")]
    pub schedule_interval_ms: u64,
    /// Seconds between timeout sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Local retries after a dispatch transport failure.
    #[serde(default = "default_dispatch_retries")]
    pub dispatch_retries: u32,
    /// Delay before the first dispatch retry, in milliseconds. Each
    /// further retry waits twice as long.
    #[serde(default = "default_dispatch_retry_delay_ms")]
    pub dispatch_retry_delay_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_task_timeout_secs: default_task_timeout_secs(),
            max_task_timeout_secs: default_max_task_timeout_secs(),
            capacity_threshold_secs: default_capacity_threshold_secs(),
            max_queued: default_max_queued(),
            max_assignments_per_cycle: default_max_assignments_per_cycle(),
            result_ttl_secs: default_result_ttl_secs(),
            schedule_interval_ms: default_schedule_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dispatch_retries: default_dispatch_retries(),
            dispatch_retry_delay_ms: default_dispatch_retry_delay_ms(),
        }
    }
}

impl RouterConfig {
    /// Per-attempt deadline when the submission sets none.
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    /// Largest per-attempt deadline a submission may ask for.
    pub fn max_task_timeout(&self) -> Duration {
        Duration::from_secs(self.max_task_timeout_secs)
    }

    /// Starvation period before a capacity signal.
    pub fn capacity_threshold(&self) -> Duration {
        Duration::from_secs(self.capacity_threshold_secs)
    }

    /// Retention of terminal tasks.
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    /// Scheduler tick.
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    /// Timeout sweep cadence.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Delay before the first dispatch retry.
    pub fn dispatch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_delay_ms)
    }
}

// ── Scale ────────────────────────────────────────────────────────────────

/// Replica bounds for one agent type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaBounds {
    /// Fewest replicas to keep.
    #[serde(default)]
    pub min: u32,
    /// Most replicas to request.
    #[serde(default = "default_max_replicas")]
    pub max: u32,
}

impl Default for ReplicaBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: default_max_replicas(),
        }
    }
}

/// Scale controller settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleConfig {
    /// Seconds between scale evaluations.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    /// Seconds after a decision during which a type is left alone.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Queued tasks per idle agent above which a type is overloaded.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    /// Utilization (working / live) below which a type is underused.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
    /// Seconds a watermark must hold before it triggers a decision.
    #[serde(default = "default_sustain_window_secs")]
    pub sustain_window_secs: u64,
    /// Scale step as a fraction of the current count.
    #[serde(default = "default_step_ratio")]
    pub step_ratio: f64,
    /// Largest single step.
    #[serde(default = "default_max_step")]
    pub max_step: u32,
    /// Unhealthy fraction above which unhealthy agents are replaced.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: f64,
    /// Scale intents kept in history.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Bounds for types without an override.
    #[serde(default)]
    pub default_bounds: ReplicaBounds,
    /// Per-type overrides keyed by role name.
    #[serde(default)]
    pub bounds: BTreeMap<String, ReplicaBounds>,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            sustain_window_secs: default_sustain_window_secs(),
            step_ratio: default_step_ratio(),
            max_step: default_max_step(),
            unhealthy_threshold: default_unhealthy_threshold(),
            history_len: default_history_len(),
            default_bounds: ReplicaBounds::default(),
            bounds: BTreeMap::new(),
        }
    }
}

impl ScaleConfig {
    /// Bounds for `agent_type`: its override, else the default bounds.
    pub fn bounds_for(&self, agent_type: AgentType) -> ReplicaBounds {
        self.bounds
            .get(agent_type.as_str())
            .copied()
            .unwrap_or(self.default_bounds)
    }

    /// Scale evaluation cadence.
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    /// Cooldown after a decision.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Time a watermark must hold.
    pub fn sustain_window(&self) -> Duration {
        Duration::from_secs(self.sustain_window_secs)
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────

/// Coordinator loop and pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Dispatches in flight at once.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Maximum age of a kept health event, in seconds.
    #[serde(default = "default_event_window_secs")]
    pub event_window_secs: u64,
    /// Maximum number of kept health events.
    #[serde(default = "default_event_window_len")]
    pub event_window_len: usize,
    /// Seconds between stats refreshes.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Seconds a removed agent's tombstone is kept.
    #[serde(default = "default_removed_retention_secs")]
    pub removed_retention_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: default_dispatch_workers(),
            event_window_secs: default_event_window_secs(),
            event_window_len: default_event_window_len(),
            stats_interval_secs: default_stats_interval_secs(),
            removed_retention_secs: default_removed_retention_secs(),
        }
    }
}

impl CoordinatorConfig {
    /// Maximum age of a kept health event.
    pub fn event_window(&self) -> Duration {
        Duration::from_secs(self.event_window_secs)
    }

    /// Stats refresh cadence.
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Tombstone retention.
    pub fn removed_retention(&self) -> Duration {
        Duration::from_secs(self.removed_retention_secs)
    }
}
