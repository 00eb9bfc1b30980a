//! Prometheus metrics for the fleet coordinator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup before starting the
//! coordinator. The helper functions (`inc_task_submitted`,
//! `record_probe`, …) are no-ops if `init_metrics` was never called, so the
//! coordinator is always safe to run and observability simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `fleet_tasks_submitted_total` | Counter | `priority` |
//! | `fleet_tasks_finished_total` | Counter | `outcome` |
//! | `fleet_agent_transitions_total` | Counter | `to` |
//! | `fleet_capacity_exhausted_total` | Counter | `agent_type` |
//! | `fleet_scale_intents_total` | Counter | `agent_type`, `direction` |
//! | `fleet_dispatch_failures_total` | Counter | `kind` |
//! | `fleet_probe_duration_seconds` | Histogram | `result` |
//! | `fleet_agents` | Gauge | `agent_type`, `state` |
//! | `fleet_queue_depth` | Gauge | `agent_type` |

use crate::FleetError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the coordinator, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Submissions accepted, by priority.
    pub tasks_submitted: CounterVec,
    /// Terminal task outcomes and requeues.
    pub tasks_finished: CounterVec,
    /// Agent lifecycle transitions by target state.
    pub agent_transitions: CounterVec,
    /// Capacity signals raised, by agent type.
    pub capacity_exhausted: CounterVec,
    /// Scale intents emitted, by agent type and direction.
    pub scale_intents: CounterVec,
    /// Dispatch failures by kind.
    pub dispatch_failures: CounterVec,
    /// Probe latency by result.
    pub probe_duration: HistogramVec,
    /// Agents per type and state.
    pub agents: IntGaugeVec,
    /// Queued tasks per scaling type.
    pub queue_depth: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<CounterVec, FleetError> {
    let c = CounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| FleetError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| FleetError::Other(format!("metrics registration failed: {e}")))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec, FleetError> {
    let g = IntGaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| FleetError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(g.clone()))
        .map_err(|e| FleetError::Other(format!("metrics registration failed: {e}")))?;
    Ok(g)
}

fn build(prefix: &str) -> Result<Metrics, FleetError> {
    let registry = Registry::new();
    let n = |s: &str| format!("{prefix}{s}");

    let tasks_submitted = counter(&registry, &n("tasks_submitted_total"), "Tasks accepted", &["priority"])?;
    let tasks_finished = counter(
        &registry,
        &n("tasks_finished_total"),
        "Task attempts finished, by outcome",
        &["outcome"],
    )?;
    let agent_transitions = counter(
        &registry,
        &n("agent_transitions_total"),
        "Agent lifecycle transitions",
        &["to"],
    )?;
    let capacity_exhausted = counter(
        &registry,
        &n("capacity_exhausted_total"),
        "Capacity exhausted signals",
        &["agent_type"],
    )?;
    let scale_intents = counter(
        &registry,
        &n("scale_intents_total"),
        "Scale intents emitted",
        &["agent_type", "direction"],
    )?;
    let dispatch_failures = counter(
        &registry,
        &n("dispatch_failures_total"),
        "Dispatch failures",
        &["kind"],
    )?;

    let probe_duration = HistogramVec::new(
        HistogramOpts::new(n("probe_duration_seconds"), "Health probe latency")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["result"],
    )
    .map_err(|e| FleetError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(probe_duration.clone()))
        .map_err(|e| FleetError::Other(format!("metrics registration failed: {e}")))?;

    let agents = gauge(&registry, &n("agents"), "Agents by type and state", &["agent_type", "state"])?;
    let queue_depth = gauge(&registry, &n("queue_depth"), "Queued tasks per type", &["agent_type"])?;

    Ok(Metrics {
        registry,
        tasks_submitted,
        tasks_finished,
        agent_transitions,
        capacity_exhausted,
        scale_intents,
        dispatch_failures,
        probe_duration,
        agents,
        queue_depth,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`FleetError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), FleetError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build("fleet_")?;
    // Racing initialisers produce identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count an accepted submission.
pub fn inc_task_submitted(priority: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.tasks_submitted.get_metric_with_label_values(&[priority]) {
            c.inc();
        }
    }
}

/// Count a finished attempt (`succeeded`, `failed`, `requeued`, `stale`).
pub fn inc_task_finished(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.tasks_finished.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count an agent lifecycle transition.
pub fn inc_agent_transition(to: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.agent_transitions.get_metric_with_label_values(&[to]) {
            c.inc();
        }
    }
}

/// Count a capacity exhausted signal.
pub fn inc_capacity_exhausted(agent_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.capacity_exhausted.get_metric_with_label_values(&[agent_type]) {
            c.inc();
        }
    }
}

/// Count an emitted scale intent (`direction` is `up`, `down` or `replace`).
pub fn inc_scale_intent(agent_type: &str, direction: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .scale_intents
            .get_metric_with_label_values(&[agent_type, direction])
        {
            c.inc();
        }
    }
}

/// Count a dispatch failure (`infrastructure`, `timeout`, `conflict`).
pub fn inc_dispatch_failure(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.dispatch_failures.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Record one probe's latency.
///
/// # Panics
///
/// This function never panics.
pub fn record_probe(result: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.probe_duration.get_metric_with_label_values(&[result]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Set the agent count gauge for one type and state.
pub fn set_agents(agent_type: &str, state: &str, count: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.agents.get_metric_with_label_values(&[agent_type, state]) {
            g.set(count);
        }
    }
}

/// Set the queue depth gauge for one scaling type.
pub fn set_queue_depth(agent_type: &str, depth: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.queue_depth.get_metric_with_label_values(&[agent_type]) {
            g.set(depth);
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Structured snapshot of the finished-task counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Finished attempts keyed by outcome label.
    pub tasks_finished: HashMap<String, u64>,
    /// Capacity signals keyed by agent type.
    pub capacity_exhausted: HashMap<String, u64>,
}

fn counter_by_label(vec: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            out.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        tasks_finished: counter_by_label(&m.tasks_finished, "outcome"),
        capacity_exhausted: counter_by_label(&m.capacity_exhausted, "agent_type"),
    }
}
