//! # Health Monitor
//!
//! ## Responsibility
//! Probe every live agent on a fixed cadence, count missed heartbeats,
//! mark agents unhealthy at the threshold, and remove agents that stay
//! unhealthy past the grace period.
//!
//! ## Guarantees
//! - Bounded fan-out: at most `max_concurrent_probes` probes in flight
//! - Isolated: a probe that errors or hangs only affects its own agent
//! - Uniform: agents without an endpoint are judged by heartbeat age, one
//!   miss per elapsed probe interval
//!
//! ## NOT Responsible For
//! - Requeueing released tasks (the caller does, see: coordinator.rs)
//! - Running the cadence loop (see: coordinator.rs)

use crate::agent::{AgentId, AgentState};
use crate::config::HealthConfig;
use crate::endpoint::{AgentEndpoint, EndpointTable, HealthStatus};
use crate::metrics;
use crate::registry::AgentRegistry;
use crate::retry::RetryPolicy;
use crate::task::TaskId;
use crate::FleetError;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// What one probe cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// Agents probed or judged by heartbeat age.
    pub probed: usize,
    /// Agents that answered or heartbeated recently.
    pub healthy: usize,
    /// Agents that missed this cycle.
    pub missed: usize,
    /// Agents that became unhealthy this cycle.
    pub newly_unhealthy: usize,
    /// Agents that went from unhealthy back to idle.
    pub recovered: usize,
    /// Agents removed this cycle.
    pub removed: Vec<AgentId>,
    /// Tasks released by this cycle, with the agent that held them.
    pub released: Vec<(AgentId, TaskId)>,
}

#[derive(Debug)]
enum ProbeResult {
    Answered(HealthStatus),
    Missed(String),
    Fresh,
}

/// Cadence-driven failure detector over the registry.
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<AgentRegistry>,
    endpoints: Arc<EndpointTable>,
    retry: RetryPolicy,
}

impl HealthMonitor {
    /// Create a monitor for `registry`, probing through `endpoints`.
    pub fn new(
        config: HealthConfig,
        registry: Arc<AgentRegistry>,
        endpoints: Arc<EndpointTable>,
    ) -> Self {
        let retry = RetryPolicy::fixed(config.probe_retries, config.probe_retry_delay());
        Self {
            config,
            registry,
            endpoints,
            retry,
        }
    }

    /// Monitor settings.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run one probe cycle anchored at `now`.
    ///
    /// First removes agents past their unhealthy grace and drained agents
    /// with no task, then probes every remaining live agent concurrently.
    pub async fn run_cycle(&self, now: Instant) -> ProbeReport {
        let mut report = ProbeReport::default();

        for (agent_id, task) in self.registry.reap(self.config.unhealthy_grace(), now) {
            if let Some(task_id) = task {
                report.released.push((agent_id.clone(), task_id));
            }
            report.removed.push(agent_id);
        }

        let targets = self.registry.probe_targets();
        report.probed = targets.len();
        let interval = self.config.probe_interval();

        let results: Vec<(AgentId, ProbeResult)> = stream::iter(targets)
            .map(|(agent_id, last_heartbeat)| {
                let endpoint = self.endpoints.get(&agent_id).map(|e| Arc::clone(e.value()));
                async move {
                    let result = match endpoint {
                        Some(ep) => self.probe_endpoint(&agent_id, ep).await,
                        None if now.saturating_duration_since(last_heartbeat) >= interval => {
                            ProbeResult::Missed("no heartbeat within probe interval".to_string())
                        }
                        None => ProbeResult::Fresh,
                    };
                    (agent_id, result)
                }
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await;

        for (agent_id, result) in results {
            self.apply(&agent_id, result, &mut report);
        }

        if report.newly_unhealthy > 0 || !report.removed.is_empty() || report.recovered > 0 {
            info!(
                probed = report.probed,
                missed = report.missed,
                newly_unhealthy = report.newly_unhealthy,
                recovered = report.recovered,
                removed = report.removed.len(),
                released = report.released.len(),
                "probe cycle"
            );
        } else {
            debug!(probed = report.probed, healthy = report.healthy, "probe cycle");
        }
        report
    }

    async fn probe_endpoint(&self, agent_id: &AgentId, endpoint: Arc<dyn AgentEndpoint>) -> ProbeResult {
        let timeout = self.config.probe_timeout();
        let started = Instant::now();
        let result = self
            .retry
            .retry(|| {
                let endpoint = Arc::clone(&endpoint);
                let agent_id = agent_id.clone();
                async move {
                    match tokio::time::timeout(timeout, endpoint.health()).await {
                        Ok(r) => r,
                        Err(_) => Err(FleetError::InfrastructureFailure {
                            agent_id,
                            reason: format!("probe timed out after {}ms", timeout.as_millis()),
                        }),
                    }
                }
            })
            .await;
        let elapsed = started.elapsed();
        match result {
            Ok(status) => {
                metrics::record_probe("ok", elapsed);
                ProbeResult::Answered(status)
            }
            Err(e) => {
                metrics::record_probe("error", elapsed);
                ProbeResult::Missed(e.to_string())
            }
        }
    }

    fn apply(&self, agent_id: &AgentId, result: ProbeResult, report: &mut ProbeReport) {
        let before = self.registry.state_of(agent_id);
        match result {
            ProbeResult::Fresh => report.healthy += 1,
            ProbeResult::Answered(status) => {
                let reported_fault = status.observed_state() == Some(AgentState::Unhealthy);
                // Err: pruned while the probe was in flight.
                if let Ok(outcome) =
                    self.registry
                        .heartbeat_at(agent_id, status.observed_state(), Instant::now())
                {
                    if reported_fault {
                        if before != Some(AgentState::Unhealthy)
                            && outcome.state == AgentState::Unhealthy
                        {
                            report.newly_unhealthy += 1;
                        }
                    } else {
                        report.healthy += 1;
                    }
                    if before == Some(AgentState::Unhealthy) && outcome.state == AgentState::Idle {
                        report.recovered += 1;
                    }
                    if let Some(task_id) = outcome.released_task {
                        report.released.push((agent_id.clone(), task_id));
                    }
                }
            }
            ProbeResult::Missed(reason) => {
                report.missed += 1;
                if let Some(outcome) = self.registry.record_missed_probe(
                    agent_id,
                    self.config.missed_threshold,
                    Instant::now(),
                ) {
                    debug!(agent_id = %agent_id, missed = outcome.missed, reason = %reason, "probe missed");
                    if outcome.became_unhealthy {
                        report.newly_unhealthy += 1;
                    }
                    if let Some(task_id) = outcome.released_task {
                        report.released.push((agent_id.clone(), task_id));
                    }
                }
            }
        }
    }
}
