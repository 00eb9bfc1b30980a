//! Agent execution endpoints.
//!
//! Every role satisfies the same contract: answer a health probe and
//! execute a task payload. The coordinator holds one
//! `Arc<dyn AgentEndpoint>` per agent that registered with an endpoint;
//! agents without one are driven by heartbeats and polling instead.
//!
//! - [`SimulatedEndpoint`]: in-process agent for tests and the demo binary

use crate::agent::{AgentId, AgentState};
use crate::task::{TaskId, TaskOutcome};
use crate::FleetError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a health probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The agent answered and reports no issue.
    Healthy,
    /// The agent answered and reports a fault.
    Unhealthy(String),
    /// The agent answered and is shutting down.
    Draining,
}

impl HealthStatus {
    /// The state the agent asks to be in, `None` when it reports no issue.
    pub fn observed_state(&self) -> Option<AgentState> {
        match self {
            Self::Healthy => None,
            Self::Unhealthy(_) => Some(AgentState::Unhealthy),
            Self::Draining => Some(AgentState::Draining),
        }
    }
}

/// Execution and probe contract shared by every agent role.
///
/// Implementations must be thread-safe (Send + Sync); the trait is
/// object-safe so the coordinator can hold `Arc<dyn AgentEndpoint>`.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Answer a health probe.
    ///
    /// # Errors
    ///
    /// [`FleetError::InfrastructureFailure`] when the agent cannot be reached.
    async fn health(&self) -> Result<HealthStatus, FleetError>;

    /// Execute one task attempt.
    ///
    /// A task-level failure is `Ok(TaskOutcome::Failure)`; `Err` is reserved
    /// for transport faults and is charged to the agent, not the task.
    ///
    /// # Errors
    ///
    /// [`FleetError::InfrastructureFailure`] when the dispatch could not be
    /// delivered or acknowledged.
    async fn execute_task(&self, task_id: &TaskId, payload: &Value)
        -> Result<TaskOutcome, FleetError>;
}

/// Endpoints keyed by agent id.
pub type EndpointTable = DashMap<AgentId, Arc<dyn AgentEndpoint>>;

/// In-process agent with configurable latency, failures and health.
///
/// Failures are deterministic: with `fail_every = n`, every n-th execution
/// returns [`TaskOutcome::Failure`].
#[derive(Debug)]
pub struct SimulatedEndpoint {
    id: AgentId,
    delay: Duration,
    fail_every: u64,
    executions: AtomicU64,
    healthy: AtomicBool,
    reachable: AtomicBool,
    draining: AtomicBool,
}

impl SimulatedEndpoint {
    /// A healthy endpoint that answers after `delay` and never fails.
    pub fn new(id: AgentId, delay: Duration) -> Self {
        Self {
            id,
            delay,
            fail_every: 0,
            executions: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        }
    }

    /// Fail every `n`-th execution. `0` disables failures.
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = n;
        self
    }

    /// Report a fault (or clear it) on the next probe.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the endpoint unreachable, so probes and dispatches error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Report `draining` on the next probe.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    /// Executions attempted so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    fn unreachable(&self) -> FleetError {
        FleetError::InfrastructureFailure {
            agent_id: self.id.clone(),
            reason: "endpoint unreachable".to_string(),
        }
    }
}

#[async_trait]
impl AgentEndpoint for SimulatedEndpoint {
    async fn health(&self) -> Result<HealthStatus, FleetError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(self.unreachable());
        }
        if self.draining.load(Ordering::SeqCst) {
            return Ok(HealthStatus::Draining);
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Ok(HealthStatus::Unhealthy("simulated fault".to_string()));
        }
        Ok(HealthStatus::Healthy)
    }

    async fn execute_task(
        &self,
        task_id: &TaskId,
        payload: &Value,
    ) -> Result<TaskOutcome, FleetError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(self.unreachable());
        }
        let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Ok(TaskOutcome::Failure(format!(
                "simulated failure on execution {n}"
            )));
        }
        Ok(TaskOutcome::Success(json!({
            "task_id": task_id,
            "agent_id": self.id,
            "echo": payload,
        })))
    }
}
