//! # Fleet Coordinator
//!
//! ## Responsibility
//! Compose the registry, health monitor, task router and scale controller
//! behind one API, dispatch assignments to agent endpoints through a
//! bounded worker pool, and run the background loops.
//!
//! ## Guarantees
//! - Every task released by a health transition or deregistration goes
//!   back to the queue without spending a retry
//! - Dispatch concurrency never exceeds `dispatch_workers`
//! - [`CoordinatorHandle::shutdown`] returns only after every loop has
//!   stopped and every in-flight dispatch has finished
//! - A probe or dispatch fault only touches its own agent and task
//!
//! ## NOT Responsible For
//! - Starting or stopping agent processes (scale intents are advisory)
//! - Wire protocols (callers wrap this API in whatever transport they use)
//!
//! ## Loops
//!
//! ```text
//! scheduler  interval + Notify  → schedule_once  (assign, dispatch, capacity signals)
//! health     probe_interval     → probe_once     (probe, reap, requeue released)
//! sweep      sweep_interval     → sweep_once     (deadlines, TTLs, tombstones)
//! scale      evaluation_interval→ scale_once     (samples, decisions, sink)
//! stats      stats_interval     → refresh_stats  (aggregates, gauges)
//! ```

use crate::agent::{AgentId, AgentState, AgentType, AgentView, CapabilitySet};
use crate::config::validation;
use crate::config::FleetConfig;
use crate::endpoint::{AgentEndpoint, EndpointTable};
use crate::events::{EventWindow, HealthEvent};
use crate::metrics;
use crate::monitor::{HealthMonitor, ProbeReport};
use crate::registry::{AgentCounts, AgentRegistry, HeartbeatOutcome, RegistrationResult};
use crate::retry::RetryPolicy;
use crate::router::{Assignment, QueueDepth, ReportDisposition, TaskCounts, TaskRouter, DEADLINE_EXCEEDED};
use crate::scale::{LoadSample, LogSink, ScaleController, ScaleIntent, ScaleIntentSink};
use crate::stats::{FleetStats, StatsCache};
use crate::task::{TaskId, TaskOutcome, TaskSpec, TaskView};
use crate::FleetError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Fleet and queue state at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Every known agent, tombstones included, sorted by id.
    pub agents: Vec<AgentView>,
    /// Live agents per role, by state.
    pub counts: BTreeMap<AgentType, AgentCounts>,
    /// Tracked tasks by state.
    pub tasks: TaskCounts,
    /// Queued tasks per scaling type.
    pub queue: QueueDepth,
    /// Assignments waiting for their agent to poll.
    pub pending_polls: usize,
}

impl FleetSnapshot {
    /// Live agents over every role.
    pub fn live_agents(&self) -> usize {
        self.counts.values().map(AgentCounts::total).sum()
    }

    fn sum_by(&self, f: impl Fn(&AgentCounts) -> usize) -> usize {
        self.counts.values().map(f).sum()
    }

    /// Format a human-readable status summary.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn format_status(&self) -> String {
        format!(
            "Fleet: {} agents ({} idle, {} working, {} unhealthy, {} draining) | Tasks: {} queued, {} in-flight, {} succeeded, {} failed",
            self.live_agents(),
            self.sum_by(|c| c.idle),
            self.sum_by(|c| c.working),
            self.sum_by(|c| c.unhealthy),
            self.sum_by(|c| c.draining),
            self.tasks.queued,
            self.tasks.assigned + self.tasks.running,
            self.tasks.succeeded,
            self.tasks.failed,
        )
    }
}

/// What one timeout sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Attempts failed by their deadline, with what happened to each task.
    pub timed_out: Vec<(TaskId, ReportDisposition)>,
    /// Terminal tasks dropped after their result TTL.
    pub purged: usize,
    /// Removed-agent tombstones dropped.
    pub pruned: usize,
}

/// Owns every component and the dispatch pool.
pub struct FleetCoordinator {
    config: FleetConfig,
    registry: Arc<AgentRegistry>,
    router: Arc<TaskRouter>,
    monitor: HealthMonitor,
    scale: ScaleController,
    sink: Arc<dyn ScaleIntentSink>,
    endpoints: Arc<EndpointTable>,
    pending: DashMap<AgentId, Assignment>,
    dispatch: Arc<Semaphore>,
    dispatch_permits: u32,
    dispatch_retry: RetryPolicy,
    event_rx: Mutex<broadcast::Receiver<HealthEvent>>,
    events: Mutex<EventWindow>,
    stats: StatsCache,
    wake: Notify,
}

impl FleetCoordinator {
    /// Build a coordinator that publishes scale intents to the log.
    ///
    /// # Errors
    ///
    /// [`FleetError::InvalidConfig`] listing every violation in `config`.
    pub fn new(config: FleetConfig) -> Result<Self, FleetError> {
        Self::with_sink(config, Arc::new(LogSink))
    }

    /// Build a coordinator that publishes scale intents to `sink`.
    ///
    /// # Errors
    ///
    /// [`FleetError::InvalidConfig`] listing every violation in `config`.
    pub fn with_sink(config: FleetConfig, sink: Arc<dyn ScaleIntentSink>) -> Result<Self, FleetError> {
        validation::validate(&config).map_err(|errors| {
            FleetError::InvalidConfig(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let dispatch_permits = u32::try_from(config.coordinator.dispatch_workers).map_err(|_| {
            FleetError::InvalidConfig("coordinator.dispatch_workers is too large".to_string())
        })?;

        let registry = Arc::new(AgentRegistry::new());
        let event_rx = Mutex::new(registry.subscribe());
        let router = Arc::new(TaskRouter::new(config.router.clone(), registry.clone()));
        let endpoints: Arc<EndpointTable> = Arc::new(DashMap::new());
        let monitor = HealthMonitor::new(config.health.clone(), registry.clone(), endpoints.clone());
        let scale = ScaleController::new(config.scale.clone());
        let dispatch_retry = RetryPolicy::exponential(
            config.router.dispatch_retries,
            config.router.dispatch_retry_delay(),
        );
        let events = Mutex::new(EventWindow::new(
            config.coordinator.event_window(),
            config.coordinator.event_window_len,
        ));

        info!(
            dispatch_workers = dispatch_permits,
            probe_interval_secs = config.health.probe_interval_secs,
            max_retries = config.router.max_retries,
            "fleet coordinator created"
        );

        Ok(Self {
            registry,
            router,
            monitor,
            scale,
            sink,
            endpoints,
            pending: DashMap::new(),
            dispatch: Arc::new(Semaphore::new(dispatch_permits as usize)),
            dispatch_permits,
            dispatch_retry,
            event_rx,
            events,
            stats: StatsCache::new(),
            wake: Notify::new(),
            config,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The task router.
    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    // ── Agents ───────────────────────────────────────────────────────────

    /// Register an agent that polls for work and sends heartbeats.
    ///
    /// # Errors
    ///
    /// [`FleetError::DuplicateId`] if a live agent already uses `agent_id`.
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        agent_type: AgentType,
        capabilities: CapabilitySet,
    ) -> Result<RegistrationResult, FleetError> {
        let result = self.registry.register(agent_id, agent_type, capabilities)?;
        self.wake.notify_one();
        Ok(result)
    }

    /// Register an agent whose tasks and probes go through `endpoint`.
    ///
    /// # Errors
    ///
    /// [`FleetError::DuplicateId`] if a live agent already uses `agent_id`.
    pub fn register_agent_with_endpoint(
        &self,
        agent_id: AgentId,
        agent_type: AgentType,
        capabilities: CapabilitySet,
        endpoint: Arc<dyn AgentEndpoint>,
    ) -> Result<RegistrationResult, FleetError> {
        let result = self
            .registry
            .register(agent_id.clone(), agent_type, capabilities)?;
        self.endpoints.insert(agent_id, endpoint);
        self.wake.notify_one();
        Ok(result)
    }

    /// Remove an agent. Its task, if any, goes back to the queue.
    ///
    /// Idempotent: unknown and already removed ids are a no-op returning
    /// `None`.
    pub fn deregister_agent(&self, agent_id: &AgentId) -> Option<TaskId> {
        let released = self.registry.deregister(agent_id);
        self.endpoints.remove(agent_id);
        self.pending.remove(agent_id);
        if let Some(task_id) = &released {
            self.requeue(agent_id, task_id);
        }
        released
    }

    /// Record a heartbeat. `observed` is the agent's own view of itself.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id was never registered.
    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        observed: Option<AgentState>,
    ) -> Result<HeartbeatOutcome, FleetError> {
        let outcome = self.registry.heartbeat(agent_id, observed)?;
        if let Some(task_id) = &outcome.released_task {
            self.pending.remove(agent_id);
            self.requeue(agent_id, task_id);
        }
        if outcome.state == AgentState::Idle {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Stop giving an agent work. It is removed once its task finishes.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id is not registered.
    pub fn drain_agent(&self, agent_id: &AgentId) -> Result<AgentState, FleetError> {
        self.registry.start_draining(agent_id)
    }

    fn requeue(&self, agent_id: &AgentId, task_id: &TaskId) {
        match self.router.requeue_released(task_id, agent_id) {
            Ok(true) => self.wake.notify_one(),
            Ok(false) => debug!(task_id = %task_id, agent_id = %agent_id, "released task already moved on"),
            Err(e) => warn!(task_id = %task_id, error = %e, "released task not requeued"),
        }
    }

    // ── Tasks ────────────────────────────────────────────────────────────

    /// Queue a task.
    ///
    /// # Errors
    ///
    /// [`FleetError::QueueFull`] when the queue is at its bound.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId, FleetError> {
        let task_id = self.router.submit(spec)?;
        self.wake.notify_one();
        Ok(task_id)
    }

    /// Current view of one task.
    pub fn task(&self, task_id: &TaskId) -> Option<TaskView> {
        self.router.view(task_id)
    }

    /// Remove and return a finished task. `Ok(None)` while in progress.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownTask`] if the task is not tracked.
    pub fn take_result(&self, task_id: &TaskId) -> Result<Option<TaskView>, FleetError> {
        self.router.take_result(task_id)
    }

    /// Hand a polling agent its assignment and mark the attempt running.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id is not registered.
    pub fn poll_assignment(&self, agent_id: &AgentId) -> Result<Option<Assignment>, FleetError> {
        if self.registry.state_of(agent_id).is_none() {
            return Err(FleetError::UnknownAgent {
                agent_id: agent_id.clone(),
            });
        }
        let Some((_, assignment)) = self.pending.remove(agent_id) else {
            return Ok(None);
        };
        if self
            .router
            .mark_running(&assignment.task_id, assignment.generation)?
        {
            Ok(Some(assignment))
        } else {
            debug!(task_id = %assignment.task_id, agent_id = %agent_id, "stale assignment dropped");
            Ok(None)
        }
    }

    /// Report the outcome of an attempt, tagged with the `generation` of
    /// its assignment. Results from superseded attempts are discarded.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownTask`] if the task is not tracked.
    pub fn report_result(
        &self,
        task_id: &TaskId,
        generation: u64,
        outcome: TaskOutcome,
    ) -> Result<ReportDisposition, FleetError> {
        let disposition = self
            .router
            .report_result_for(task_id, generation, outcome, Instant::now())?;
        if disposition != ReportDisposition::Stale {
            self.wake.notify_one();
        }
        Ok(disposition)
    }

    // ── Cycles ───────────────────────────────────────────────────────────

    /// Run one scheduling pass: assign queued tasks, dispatch to
    /// endpoints, park assignments for polling agents, and forward
    /// capacity signals. Returns the number of assignments made.
    pub async fn schedule_once(self: &Arc<Self>) -> usize {
        let outcome = self.router.try_assign(Instant::now());

        for signal in &outcome.capacity_signals {
            if let Err(e) = self.scale.capacity_exhausted(signal) {
                debug!(error = %e, waiting = signal.waiting, "capacity signal without a role");
            }
        }

        let made = outcome.assignments.len();
        for assignment in outcome.assignments {
            let endpoint = self
                .endpoints
                .get(&assignment.agent_id)
                .map(|e| Arc::clone(e.value()));
            let Some(endpoint) = endpoint else {
                self.pending.insert(assignment.agent_id.clone(), assignment);
                continue;
            };
            // Err only if the pool is closed; the deadline sweep reclaims the task.
            let Ok(permit) = Arc::clone(&self.dispatch).acquire_owned().await else {
                warn!(task_id = %assignment.task_id, "dispatch pool closed");
                continue;
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                this.dispatch(assignment, endpoint).await;
            });
        }
        made
    }

    async fn dispatch(&self, assignment: Assignment, endpoint: Arc<dyn AgentEndpoint>) {
        let task_id = &assignment.task_id;
        let agent_id = &assignment.agent_id;
        match self.router.mark_running(task_id, assignment.generation) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                debug!(task_id = %task_id, "assignment superseded before dispatch");
                return;
            }
        }

        let ep = &endpoint;
        let payload = &assignment.payload;
        let attempt = self.dispatch_retry.retry_if(
            move || ep.execute_task(task_id, payload),
            |e: &FleetError| matches!(e, FleetError::InfrastructureFailure { .. }),
        );

        match tokio::time::timeout_at(assignment.deadline, attempt).await {
            Ok(Ok(outcome)) => {
                match self.router.report_result_for(
                    task_id,
                    assignment.generation,
                    outcome,
                    Instant::now(),
                ) {
                    Ok(disposition) => {
                        debug!(task_id = %task_id, agent_id = %agent_id, ?disposition, "dispatch finished")
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "dispatch result dropped"),
                }
            }
            Ok(Err(e)) => {
                metrics::inc_dispatch_failure("infrastructure");
                warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "dispatch failed");
                match self.registry.mark_unhealthy(agent_id, &e.to_string()) {
                    Ok(Some(released)) => self.requeue(agent_id, &released),
                    // Draining agents cannot turn unhealthy; detach the task instead.
                    Ok(None) => {
                        if self.registry.unclaim(agent_id, task_id) {
                            self.requeue(agent_id, task_id);
                        }
                    }
                    Err(e) => debug!(agent_id = %agent_id, error = %e, "agent gone before fault recorded"),
                }
            }
            Err(_) => {
                metrics::inc_dispatch_failure("timeout");
                match self.router.report_result_for(
                    task_id,
                    assignment.generation,
                    TaskOutcome::Failure(DEADLINE_EXCEEDED.to_string()),
                    Instant::now(),
                ) {
                    Ok(disposition) => {
                        warn!(task_id = %task_id, agent_id = %agent_id, ?disposition, "dispatch timed out")
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "dispatch timeout not recorded"),
                }
            }
        }
        self.wake.notify_one();
    }

    /// Run one probe cycle and requeue every task it released.
    pub async fn probe_once(&self) -> ProbeReport {
        let report = self.monitor.run_cycle(Instant::now()).await;
        for (agent_id, task_id) in &report.released {
            self.pending.remove(agent_id);
            self.requeue(agent_id, task_id);
        }
        for agent_id in &report.removed {
            self.endpoints.remove(agent_id);
        }
        if report.recovered > 0 {
            self.wake.notify_one();
        }
        self.collect_events();
        report
    }

    /// Fail overdue attempts, drop expired results and old tombstones.
    pub fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let timed_out = self.router.timeout_sweep(now);
        let purged = self.router.purge_expired(now);
        let pruned = self
            .registry
            .prune_removed(self.config.coordinator.removed_retention(), now);
        self.collect_events();
        self.events.lock().prune(Utc::now());
        if !timed_out.is_empty() {
            self.wake.notify_one();
        }
        if !timed_out.is_empty() || purged > 0 || pruned > 0 {
            info!(timed_out = timed_out.len(), purged, pruned, "sweep");
        }
        SweepReport {
            timed_out,
            purged,
            pruned,
        }
    }

    /// Feed load samples for every role to the scale controller, evaluate,
    /// and publish the resulting intents.
    ///
    /// Load samples are read from the registry's per-type counts, which
    /// every health transition updates before its event is broadcast.
    pub async fn scale_once(&self) -> Vec<ScaleIntent> {
        self.collect_events();
        let now = Instant::now();
        let counts = self.registry.counts_by_type();
        let depth = self.router.queue_depth();
        for agent_type in AgentType::ALL {
            let c = counts.get(&agent_type).copied().unwrap_or_default();
            let queued = depth.by_type.get(&agent_type).copied().unwrap_or(0);
            self.scale
                .observe(agent_type, LoadSample::from_counts(&c, queued), now);
        }

        let intents = self.scale.evaluate(now);
        for intent in &intents {
            if let Err(e) = self.sink.publish(intent).await {
                warn!(agent_type = %intent.agent_type, error = %e, "scale intent not delivered");
            }
        }
        intents
    }

    /// Rebuild the stats cache.
    pub fn refresh_stats(&self) -> FleetStats {
        self.collect_events();
        self.stats.refresh(&self.registry, &self.router, Instant::now())
    }

    fn collect_events(&self) {
        let mut rx = self.event_rx.lock();
        let mut window = self.events.lock();
        loop {
            match rx.try_recv() {
                Ok(event) => window.push(event),
                Err(TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "health event window lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    // ── Views ────────────────────────────────────────────────────────────

    /// Fleet and queue state.
    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            taken_at: Utc::now(),
            agents: self.registry.snapshot(Instant::now()),
            counts: self.registry.counts_by_type(),
            tasks: self.router.counts(),
            queue: self.router.queue_depth(),
            pending_polls: self.pending.len(),
        }
    }

    /// Retained scale intents, oldest first.
    pub fn scale_intents(&self) -> Vec<ScaleIntent> {
        self.scale.intents()
    }

    /// Up to `limit` health events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<HealthEvent> {
        self.collect_events();
        self.events.lock().recent(limit)
    }

    /// Last stats refresh.
    pub fn stats(&self) -> FleetStats {
        self.stats.current()
    }

    // ── Background loops ─────────────────────────────────────────────────

    /// Spawn every background loop.
    ///
    /// # Panics
    ///
    /// This function never panics. It must be called inside a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> CoordinatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loops = vec![
            self.spawn_scheduler(shutdown_rx.clone()),
            self.spawn_periodic("health", self.config.health.probe_interval(), shutdown_rx.clone(), |c| async move {
                c.probe_once().await;
            }),
            self.spawn_periodic("sweep", self.config.router.sweep_interval(), shutdown_rx.clone(), |c| async move {
                c.sweep_once();
            }),
            self.spawn_periodic("scale", self.config.scale.evaluation_interval(), shutdown_rx.clone(), |c| async move {
                c.scale_once().await;
            }),
            self.spawn_periodic("stats", self.config.coordinator.stats_interval(), shutdown_rx, |c| async move {
                c.refresh_stats();
                info!(status = %c.snapshot().format_status(), "fleet status");
            }),
        ];
        info!(loops = loops.len(), "fleet coordinator started");
        CoordinatorHandle {
            coordinator: Arc::clone(self),
            shutdown_tx,
            loops,
        }
    }

    fn spawn_scheduler(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.router.schedule_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.wake.notified() => {}
                    _ = shutdown.changed() => break,
                }
                this.schedule_once().await;
            }
            debug!("scheduler loop stopped");
        })
    }

    fn spawn_periodic<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        f: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => f(Arc::clone(&this)).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(name, "loop stopped");
        })
    }
}

/// Running loops of a started coordinator.
pub struct CoordinatorHandle {
    coordinator: Arc<FleetCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// The coordinator these loops drive.
    pub fn coordinator(&self) -> &Arc<FleetCoordinator> {
        &self.coordinator
    }

    /// Stop every loop, then wait for in-flight dispatches to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "coordinator loop ended abnormally");
            }
        }
        let permits = self.coordinator.dispatch_permits;
        match self.coordinator.dispatch.acquire_many(permits).await {
            Ok(all) => drop(all),
            Err(e) => warn!(error = %e, "dispatch pool closed before drain"),
        }
        info!("fleet coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::capability_set;
    use crate::endpoint::SimulatedEndpoint;
    use crate::scale::{ChannelSink, ScaleReason};
    use crate::task::TaskState;
    use serde_json::json;

    fn coordinator() -> Arc<FleetCoordinator> {
        Arc::new(FleetCoordinator::new(FleetConfig::default()).expect("default config is valid"))
    }

    #[tokio::test]
    async fn test_invalid_config_lists_violations() {
        let mut config = FleetConfig::default();
        config.health.missed_threshold = 0;
        config.scale.step_ratio = 0.0;
        let err = FleetCoordinator::new(config).err().expect("must reject");
        let msg = err.to_string();
        assert!(msg.contains("missed_threshold"), "{msg}");
        assert!(msg.contains("step_ratio"), "{msg}");
    }

    #[tokio::test]
    async fn test_dispatch_retries_back_off() {
        let c = coordinator();
        let router = &c.config().router;
        assert_eq!(c.dispatch_retry.max_attempts, router.dispatch_retries as usize + 1);
        let first = c.dispatch_retry.delay_for(1);
        assert_eq!(first, router.dispatch_retry_delay());
        assert_eq!(c.dispatch_retry.delay_for(2), first * 2);
    }

    #[tokio::test]
    async fn test_polling_agent_round_trip() {
        let c = coordinator();
        let agent = AgentId::new("cr-1");
        c.register_agent(agent.clone(), AgentType::CodeReview, CapabilitySet::new())
            .expect("register");
        let task_id = c
            .submit_task(TaskSpec::new(["security_scan"]).with_payload(json!({"pr": 7})))
            .expect("submit");

        assert_eq!(c.schedule_once().await, 1);
        let assignment = c.poll_assignment(&agent).expect("poll").expect("assignment");
        assert_eq!(assignment.task_id, task_id);
        assert_eq!(c.task(&task_id).map(|t| t.state), Some(TaskState::Running));

        let d = c
            .report_result(&task_id, assignment.generation, TaskOutcome::Success(json!("lgtm")))
            .expect("report");
        assert_eq!(d, ReportDisposition::Succeeded);
        let view = c.take_result(&task_id).expect("known").expect("finished");
        assert_eq!(view.result, Some(json!("lgtm")));
        assert_eq!(c.registry().state_of(&agent), Some(AgentState::Idle));
    }

    #[tokio::test]
    async fn test_poll_unknown_agent_errors() {
        let c = coordinator();
        let err = c.poll_assignment(&AgentId::new("ghost")).err();
        assert!(matches!(err, Some(FleetError::UnknownAgent { .. })));
    }

    #[tokio::test]
    async fn test_deregister_requeues_held_task() {
        let c = coordinator();
        let agent = AgentId::new("t-1");
        c.register_agent(agent.clone(), AgentType::Testing, CapabilitySet::new())
            .expect("register");
        let task_id = c.submit_task(TaskSpec::new(["unit_test_generation"])).expect("submit");
        c.schedule_once().await;

        assert_eq!(c.deregister_agent(&agent), Some(task_id.clone()));
        assert_eq!(c.deregister_agent(&agent), None);
        let view = c.task(&task_id).expect("tracked");
        assert_eq!(view.state, TaskState::Queued);
        assert_eq!(view.retry_count, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_heartbeat_requeues_task() {
        let c = coordinator();
        let agent = AgentId::new("t-1");
        c.register_agent(agent.clone(), AgentType::Testing, CapabilitySet::new())
            .expect("register");
        let task_id = c.submit_task(TaskSpec::new(["unit_test_generation"])).expect("submit");
        c.schedule_once().await;

        let outcome = c
            .heartbeat(&agent, Some(AgentState::Unhealthy))
            .expect("heartbeat");
        assert_eq!(outcome.released_task, Some(task_id.clone()));
        assert_eq!(c.task(&task_id).map(|t| t.state), Some(TaskState::Queued));
        assert_eq!(c.poll_assignment(&agent).expect("poll"), None);
        assert!(!c.recent_events(10).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_dispatch_completes_task() {
        let c = coordinator();
        let agent = AgentId::new("d-1");
        let ep = Arc::new(SimulatedEndpoint::new(agent.clone(), Duration::from_millis(20)));
        c.register_agent_with_endpoint(agent.clone(), AgentType::Deployment, CapabilitySet::new(), ep.clone())
            .expect("register");
        let task_id = c.submit_task(TaskSpec::new(["build_execution"])).expect("submit");

        let handle = c.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown().await;

        assert_eq!(ep.executions(), 1);
        assert_eq!(c.task(&task_id).map(|t| t.state), Some(TaskState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_endpoint_marks_agent_unhealthy() {
        let c = coordinator();
        let agent = AgentId::new("d-1");
        let ep = Arc::new(SimulatedEndpoint::new(agent.clone(), Duration::from_millis(5)));
        ep.set_reachable(false);
        c.register_agent_with_endpoint(agent.clone(), AgentType::Deployment, CapabilitySet::new(), ep)
            .expect("register");
        let task_id = c.submit_task(TaskSpec::new(["build_execution"])).expect("submit");

        c.schedule_once().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(c.registry().state_of(&agent), Some(AgentState::Unhealthy));
        let view = c.task(&task_id).expect("tracked");
        assert_eq!(view.state, TaskState::Queued);
        assert_eq!(view.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_fault_on_draining_agent_requeues_without_retry() {
        let c = coordinator();
        let agent = AgentId::new("d-2");
        let ep = Arc::new(SimulatedEndpoint::new(agent.clone(), Duration::from_millis(5)));
        ep.set_reachable(false);
        c.register_agent_with_endpoint(agent.clone(), AgentType::Deployment, CapabilitySet::new(), ep)
            .expect("register");
        let task_id = c.submit_task(TaskSpec::new(["build_execution"])).expect("submit");

        assert_eq!(c.schedule_once().await, 1);
        assert_eq!(c.drain_agent(&agent).expect("known"), AgentState::Draining);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(c.registry().state_of(&agent), Some(AgentState::Draining));
        let view = c.task(&task_id).expect("tracked");
        assert_eq!(view.state, TaskState::Queued);
        assert_eq!(view.retry_count, 0);
        assert_eq!(view.assigned_agent, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_past_deadline_spends_a_retry() {
        let c = coordinator();
        let agent = AgentId::new("d-slow");
        let ep = Arc::new(SimulatedEndpoint::new(agent.clone(), Duration::from_secs(30)));
        c.register_agent_with_endpoint(agent.clone(), AgentType::Deployment, CapabilitySet::new(), ep)
            .expect("register");
        let task_id = c
            .submit_task(TaskSpec::new(["build_execution"]).with_timeout(Duration::from_secs(2)))
            .expect("submit");

        assert_eq!(c.schedule_once().await, 1);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let view = c.task(&task_id).expect("tracked");
        assert_eq!(view.state, TaskState::Queued);
        assert_eq!(view.retry_count, 1);
        assert_eq!(view.last_failure.as_deref(), Some(DEADLINE_EXCEEDED));
        assert_eq!(c.registry().state_of(&agent), Some(AgentState::Idle));
    }

    #[tokio::test]
    async fn test_late_result_from_replaced_agent_is_stale() {
        let c = coordinator();
        let old = AgentId::new("t-old");
        c.register_agent(old.clone(), AgentType::Testing, CapabilitySet::new())
            .expect("register");
        let task_id = c.submit_task(TaskSpec::new(["unit_test_generation"])).expect("submit");
        c.schedule_once().await;
        let first = c.poll_assignment(&old).expect("poll").expect("assignment");
        c.heartbeat(&old, Some(AgentState::Unhealthy)).expect("heartbeat");

        let new = AgentId::new("t-new");
        c.register_agent(new.clone(), AgentType::Testing, CapabilitySet::new())
            .expect("register");
        assert_eq!(c.schedule_once().await, 1);
        let second = c.poll_assignment(&new).expect("poll").expect("assignment");
        assert_ne!(first.generation, second.generation);

        let late = c
            .report_result(&task_id, first.generation, TaskOutcome::Failure("old agent late".into()))
            .expect("report");
        assert_eq!(late, ReportDisposition::Stale);
        assert_eq!(c.registry().state_of(&new), Some(AgentState::Working));
        let view = c.task(&task_id).expect("tracked");
        assert_eq!(view.state, TaskState::Running);
        assert_eq!(view.retry_count, 0);

        let done = c
            .report_result(&task_id, second.generation, TaskOutcome::Success(json!(true)))
            .expect("report");
        assert_eq!(done, ReportDisposition::Succeeded);
    }

    #[tokio::test]
    async fn test_oversized_timeout_rejected_and_fleet_keeps_scheduling() {
        let c = coordinator();
        let agent = AgentId::new("cr-9");
        c.register_agent(agent.clone(), AgentType::CodeReview, CapabilitySet::new())
            .expect("register");
        let mut huge = TaskSpec::new(["security_scan"]);
        huge.timeout_secs = Some(u64::MAX / 2);
        assert!(matches!(c.submit_task(huge).err(), Some(FleetError::InvalidTask { .. })));

        let task_id = c.submit_task(TaskSpec::new(["security_scan"])).expect("submit");
        assert_eq!(c.schedule_once().await, 1);
        let assignment = c.poll_assignment(&agent).expect("poll").expect("assignment");
        assert_eq!(assignment.task_id, task_id);
    }

    #[tokio::test]
    async fn test_scale_once_publishes_to_sink() {
        let mut config = FleetConfig::default();
        config.scale.bounds.insert(
            "research".to_string(),
            crate::config::ReplicaBounds { min: 2, max: 10 },
        );
        let (sink, mut rx) = ChannelSink::new(16);
        let c = Arc::new(FleetCoordinator::with_sink(config, Arc::new(sink)).expect("valid"));

        let intents = c.scale_once().await;
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].agent_type, AgentType::Research);
        assert_eq!(intents[0].desired, 2);
        assert_eq!(rx.recv().await.map(|i| i.desired), Some(2));
        assert_eq!(c.scale_intents().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_transition_drives_health_intent() {
        let c = coordinator();
        let sick = AgentId::new("t-sick");
        c.register_agent(sick.clone(), AgentType::Testing, CapabilitySet::new())
            .expect("register");
        c.register_agent(AgentId::new("t-fine"), AgentType::Testing, CapabilitySet::new())
            .expect("register");
        c.heartbeat(&sick, Some(AgentState::Unhealthy)).expect("heartbeat");

        let intents = c.scale_once().await;
        let testing: Vec<_> = intents
            .iter()
            .filter(|i| i.agent_type == AgentType::Testing)
            .collect();
        assert_eq!(testing.len(), 1);
        assert_eq!(testing[0].reason, ScaleReason::Health);
        assert_eq!((testing[0].current, testing[0].desired), (2, 3));
        assert!(c
            .recent_events(16)
            .iter()
            .any(|e| e.agent_id == sick && e.to == AgentState::Unhealthy));
    }

    #[tokio::test]
    async fn test_snapshot_status_line() {
        let c = coordinator();
        c.register_agent(AgentId::new("a-1"), AgentType::Analytics, capability_set(["sql"]))
            .expect("register");
        c.submit_task(TaskSpec::new(["gpu"])).expect("submit");
        let snap = c.snapshot();
        assert_eq!(snap.live_agents(), 1);
        let status = snap.format_status();
        assert!(status.contains("1 agents"), "{status}");
        assert!(status.contains("1 queued"), "{status}");
        let json = serde_json::to_string(&snap).expect("snapshot serializes");
        assert!(json.contains("analytics"));
    }
}
