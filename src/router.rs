//! # Task Router
//!
//! ## Responsibility
//! Accept tasks, keep them in a priority queue, bind queued tasks to
//! eligible idle agents, apply results with a bounded retry budget, and
//! raise one [`CapacityExhausted`] signal per starved role.
//!
//! ## Guarantees
//! - Ordered: highest priority first, FIFO within a priority
//! - Non-blocking: a task with no eligible agent never holds back the
//!   tasks queued behind it
//! - Exclusive: an assignment claims the agent first and then
//!   compare-and-sets the task on its generation; a lost race undoes the
//!   claim, so no task ever has two agents
//! - Stale-safe: results tagged with an old generation are discarded
//!
//! ## NOT Responsible For
//! - Delivering assignments to agents (see: coordinator.rs)
//! - Deciding scale (see: scale.rs)
//!
//! ## Locking
//! The heap mutex and task entry guards are never held at the same time
//! except in `submit`, which takes the heap first. Scheduling passes are
//! serialized by their own mutex and do not hold the heap while claiming.

use crate::agent::{AgentId, AgentType, CapabilitySet};
use crate::config::RouterConfig;
use crate::metrics;
use crate::registry::AgentRegistry;
use crate::task::{Priority, Task, TaskId, TaskOutcome, TaskSpec, TaskState, TaskView};
use crate::FleetError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failure reason attached to attempts that outlived their deadline.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// A task bound to an agent, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// The assigned task.
    pub task_id: TaskId,
    /// The claimed agent.
    pub agent_id: AgentId,
    /// Generation of this attempt; tag the result with it.
    pub generation: u64,
    /// Task payload to deliver.
    pub payload: Value,
    /// When this attempt times out.
    pub deadline: Instant,
}

/// No eligible agent existed for a role's tasks for longer than the
/// threshold. Tag sets of the same role are merged into one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityExhausted {
    /// Role that would serve the tags, explicit or inferred.
    pub agent_type: Option<AgentType>,
    /// Union of the starved tag sets.
    pub tags: CapabilitySet,
    /// Tasks waiting on these tags at signal time.
    pub waiting: usize,
    /// How long the tags have gone unmatched.
    pub starved_for: Duration,
}

impl CapacityExhausted {
    /// The equivalent [`FleetError::CapacityExhausted`].
    pub fn to_error(&self) -> FleetError {
        FleetError::CapacityExhausted {
            tags: self.tags.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub struct AssignOutcome {
    /// New bindings, in assignment order.
    pub assignments: Vec<Assignment>,
    /// Capacity signals raised by this pass.
    pub capacity_signals: Vec<CapacityExhausted>,
}

/// What happened to a reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum ReportDisposition {
    /// The task finished successfully.
    Succeeded,
    /// The attempt failed and the task went back to the queue.
    Requeued {
        /// Failed attempts so far.
        retry_count: u32,
    },
    /// The attempt failed and the retry budget is spent.
    Failed,
    /// The result belongs to an earlier attempt or a finished task.
    Stale,
}

impl ReportDisposition {
    fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Requeued { .. } => "requeued",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }
}

/// Tasks by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    /// Waiting for an agent.
    pub queued: usize,
    /// Bound, dispatch pending.
    pub assigned: usize,
    /// Accepted by the agent.
    pub running: usize,
    /// Finished successfully, result not yet taken.
    pub succeeded: usize,
    /// Failed permanently, not yet taken.
    pub failed: usize,
}

/// Queued tasks per scaling type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Tasks whose role is explicit or inferable.
    pub by_type: BTreeMap<AgentType, usize>,
    /// Tasks no single role covers.
    pub untyped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    sequence: u64,
    task_id: TaskId,
    generation: u64,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DemandKey {
    agent_type: Option<AgentType>,
    tags: CapabilitySet,
}

impl DemandKey {
    fn scaling_type(&self) -> Option<AgentType> {
        self.agent_type.or_else(|| AgentType::infer(&self.tags))
    }

    fn signal_key(&self) -> SignalKey {
        match self.scaling_type() {
            Some(t) => SignalKey::Typed(t),
            None => SignalKey::Untyped(self.tags.clone()),
        }
    }
}

/// Capacity signals are raised once per role; tags no role covers are
/// grouped by tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SignalKey {
    Typed(AgentType),
    Untyped(CapabilitySet),
}

#[derive(Debug)]
struct Starvation {
    since: Instant,
    signalled: bool,
}

/// Priority queue, task table and assignment logic.
pub struct TaskRouter {
    config: RouterConfig,
    registry: Arc<AgentRegistry>,
    tasks: DashMap<TaskId, Task>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    queued: AtomicUsize,
    sequence: AtomicU64,
    cycle: Mutex<HashMap<DemandKey, Starvation>>,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl TaskRouter {
    /// Create a router that assigns from `registry`.
    pub fn new(config: RouterConfig, registry: Arc<AgentRegistry>) -> Self {
        Self {
            config,
            registry,
            tasks: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            queued: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            cycle: Mutex::new(HashMap::new()),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Router settings.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Accept a task into the queue.
    ///
    /// # Errors
    ///
    /// [`FleetError::InvalidTask`] when `timeout_secs` is zero or above
    /// `max_task_timeout_secs`. [`FleetError::QueueFull`] when `max_queued`
    /// tasks are already waiting.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, FleetError> {
        if let Some(secs) = spec.timeout_secs {
            if secs == 0 || secs > self.config.max_task_timeout_secs {
                metrics::inc_task_finished("rejected");
                return Err(FleetError::InvalidTask {
                    reason: format!(
                        "timeout_secs {secs} outside 1..={}",
                        self.config.max_task_timeout_secs
                    ),
                });
            }
        }
        let now = Instant::now();
        let id = TaskId::generate();
        let mut queue = self.queue.lock();
        if self.queued.load(AtomicOrdering::SeqCst) >= self.config.max_queued {
            metrics::inc_task_finished("rejected");
            return Err(FleetError::QueueFull {
                capacity: self.config.max_queued,
            });
        }
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let task = Task::from_spec(
            id.clone(),
            spec,
            sequence,
            self.config.default_task_timeout(),
            now,
        );
        let entry = QueueEntry {
            priority: task.priority,
            sequence,
            task_id: id.clone(),
            generation: task.generation,
        };
        let priority = task.priority;
        debug!(task_id = %id, priority = priority.as_str(), tags = task.required.len(), "task submitted");
        self.tasks.insert(id.clone(), task);
        queue.push(entry);
        self.queued.fetch_add(1, AtomicOrdering::SeqCst);
        drop(queue);
        metrics::inc_task_submitted(priority.as_str());
        Ok(id)
    }

    /// Run one scheduling pass at `now`.
    ///
    /// Walks the queue highest priority first and binds each task to the
    /// first eligible agent that can still be claimed, preferring agents
    /// that have not already failed the task. Unmatched tasks stay queued
    /// without blocking the ones behind them.
    pub fn try_assign(&self, now: Instant) -> AssignOutcome {
        let mut starvation = self.cycle.lock();
        let mut local = std::mem::take(&mut *self.queue.lock());

        let mut outcome = AssignOutcome::default();
        let mut pending: Vec<QueueEntry> = Vec::new();
        let mut candidates: HashMap<DemandKey, VecDeque<AgentId>> = HashMap::new();
        let mut starved: HashMap<DemandKey, usize> = HashMap::new();
        let mut matched: HashSet<DemandKey> = HashSet::new();
        let max = self.config.max_assignments_per_cycle;
        let mut complete = true;

        while let Some(entry) = local.pop() {
            if outcome.assignments.len() >= max {
                pending.push(entry);
                complete = false;
                break;
            }

            let (key, failed_agents) = {
                let Some(task) = self.tasks.get(&entry.task_id) else {
                    continue;
                };
                if task.state != TaskState::Queued || task.generation != entry.generation {
                    continue;
                }
                (
                    DemandKey {
                        agent_type: task.agent_type,
                        tags: task.required.clone(),
                    },
                    task.failed_agents.clone(),
                )
            };

            let pool = candidates
                .entry(key.clone())
                .or_insert_with(|| self.registry.eligible_ids(&key.tags, key.agent_type).into());

            let mut bound = None;
            while !pool.is_empty() {
                let idx = pool
                    .iter()
                    .position(|a| !failed_agents.contains(a))
                    .unwrap_or(0);
                let Some(agent_id) = pool.remove(idx) else {
                    break;
                };
                if self.registry.claim(&agent_id, &entry.task_id).is_ok() {
                    bound = Some(agent_id);
                    break;
                }
            }

            let Some(agent_id) = bound else {
                *starved.entry(key).or_insert(0) += 1;
                pending.push(entry);
                continue;
            };

            match self.bind(&entry, &agent_id, now) {
                Some(assignment) => {
                    matched.insert(key);
                    outcome.assignments.push(assignment);
                }
                None => {
                    self.registry.unclaim(&agent_id, &entry.task_id);
                    metrics::inc_dispatch_failure("conflict");
                }
            }
        }

        pending.extend(local.into_vec());
        if !pending.is_empty() {
            self.queue.lock().extend(pending);
        }

        outcome.capacity_signals =
            self.update_starvation(&mut starvation, starved, &matched, complete, now);

        if !outcome.assignments.is_empty() {
            debug!(assigned = outcome.assignments.len(), "scheduling pass");
        }
        outcome
    }

    /// Compare-and-set a queued task to `assigned` on its generation.
    fn bind(&self, entry: &QueueEntry, agent_id: &AgentId, now: Instant) -> Option<Assignment> {
        let mut task = self.tasks.get_mut(&entry.task_id)?;
        if task.state != TaskState::Queued || task.generation != entry.generation {
            return None;
        }
        task.state = TaskState::Assigned;
        task.assigned_agent = Some(agent_id.clone());
        task.generation += 1;
        // An unrepresentable deadline expires on the next sweep.
        let deadline = now.checked_add(task.timeout).unwrap_or(now);
        task.deadline = Some(deadline);
        self.queued.fetch_sub(1, AtomicOrdering::SeqCst);
        Some(Assignment {
            task_id: task.id.clone(),
            agent_id: agent_id.clone(),
            generation: task.generation,
            payload: task.payload.clone(),
            deadline,
        })
    }

    fn update_starvation(
        &self,
        state: &mut HashMap<DemandKey, Starvation>,
        starved: HashMap<DemandKey, usize>,
        matched: &HashSet<DemandKey>,
        complete: bool,
        now: Instant,
    ) -> Vec<CapacityExhausted> {
        // An assignment re-arms the key; so does having nothing waiting.
        state.retain(|key, _| !matched.contains(key) && (!complete || starved.contains_key(key)));

        // A role with a signal still outstanding absorbs its other tag sets.
        let outstanding: HashSet<SignalKey> = state
            .iter()
            .filter(|(_, s)| s.signalled)
            .map(|(key, _)| key.signal_key())
            .collect();

        let threshold = self.config.capacity_threshold();
        let mut fresh: HashMap<SignalKey, CapacityExhausted> = HashMap::new();
        for (key, waiting) in starved {
            if matched.contains(&key) {
                continue;
            }
            let entry = state.entry(key.clone()).or_insert(Starvation {
                since: now,
                signalled: false,
            });
            let starved_for = now.saturating_duration_since(entry.since);
            if entry.signalled || starved_for < threshold {
                continue;
            }
            entry.signalled = true;
            let signal_key = key.signal_key();
            if outstanding.contains(&signal_key) {
                continue;
            }
            match fresh.get_mut(&signal_key) {
                Some(signal) => {
                    signal.tags.extend(key.tags);
                    signal.waiting += waiting;
                    signal.starved_for = signal.starved_for.max(starved_for);
                }
                None => {
                    fresh.insert(
                        signal_key,
                        CapacityExhausted {
                            agent_type: key.scaling_type(),
                            tags: key.tags,
                            waiting,
                            starved_for,
                        },
                    );
                }
            }
        }

        let mut signals: Vec<CapacityExhausted> = fresh.into_values().collect();
        signals.sort_by(|a, b| (a.agent_type, &a.tags).cmp(&(b.agent_type, &b.tags)));
        for signal in &signals {
            let label = signal.agent_type.map_or("untyped", |t| t.as_str());
            metrics::inc_capacity_exhausted(label);
            warn!(
                agent_type = label,
                tags = ?signal.tags,
                waiting = signal.waiting,
                starved_secs = signal.starved_for.as_secs(),
                "capacity exhausted"
            );
        }
        signals
    }

    /// Mark an assigned task `running` once the agent accepted it.
    ///
    /// Returns `false` if the attempt is no longer current.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownTask`] if the task is not tracked.
    pub fn mark_running(&self, task_id: &TaskId, generation: u64) -> Result<bool, FleetError> {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| FleetError::UnknownTask {
                task_id: task_id.clone(),
            })?;
        if task.state == TaskState::Assigned && task.generation == generation {
            task.state = TaskState::Running;
            return Ok(true);
        }
        Ok(false)
    }

    /// Apply a result for attempt `generation` of `task_id`, stamped now.
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
        self.report_result_for(task_id, generation, outcome, Instant::now())
    }

    /// Apply a result, discarding it if `generation` is not the current
    /// attempt.
    ///
    /// Success finishes the task and frees the agent. Failure counts
    /// against the retry budget: under `max_retries` the task is requeued
    /// and the failing agent is passed over next time when another agent
    /// is eligible; at the limit the task fails with the reason attached.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownTask`] if the task is not tracked.
    pub fn report_result_for(
        &self,
        task_id: &TaskId,
        generation: u64,
        outcome: TaskOutcome,
        now: Instant,
    ) -> Result<ReportDisposition, FleetError> {
        let (disposition, agent, requeue) = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| FleetError::UnknownTask {
                    task_id: task_id.clone(),
                })?;

            let current = task.state.is_in_flight() && generation == task.generation;
            if !current {
                (ReportDisposition::Stale, None, None)
            } else {
                let agent = task.assigned_agent.take();
                task.deadline = None;
                match outcome {
                    TaskOutcome::Success(value) => {
                        task.state = TaskState::Succeeded;
                        task.result = Some(value);
                        task.finished_at = Some(now);
                        (ReportDisposition::Succeeded, agent, None)
                    }
                    TaskOutcome::Failure(reason) => {
                        let (d, entry) = self.fail_attempt(&mut task, reason, agent.clone(), now);
                        (d, agent, entry)
                    }
                }
            }
        };

        if let Some(agent_id) = &agent {
            self.registry.release(
                agent_id,
                task_id,
                disposition == ReportDisposition::Succeeded,
            );
        }
        if let Some(entry) = requeue {
            self.queue.lock().push(entry);
        }

        match disposition {
            ReportDisposition::Succeeded => {
                self.succeeded.fetch_add(1, AtomicOrdering::SeqCst);
                debug!(task_id = %task_id, agent_id = ?agent, "task succeeded");
            }
            ReportDisposition::Failed => {
                self.failed.fetch_add(1, AtomicOrdering::SeqCst);
                warn!(task_id = %task_id, agent_id = ?agent, "task failed permanently");
            }
            ReportDisposition::Requeued { retry_count } => {
                info!(task_id = %task_id, agent_id = ?agent, retry_count, "task requeued after failure");
            }
            ReportDisposition::Stale => {
                debug!(task_id = %task_id, generation, "stale result discarded");
            }
        }
        metrics::inc_task_finished(disposition.label());
        Ok(disposition)
    }

    fn fail_attempt(
        &self,
        task: &mut Task,
        reason: String,
        agent: Option<AgentId>,
        now: Instant,
    ) -> (ReportDisposition, Option<QueueEntry>) {
        task.retry_count += 1;
        task.last_failure = Some(reason);
        if let Some(agent_id) = agent {
            if !task.failed_agents.contains(&agent_id) {
                task.failed_agents.push(agent_id);
            }
        }
        if task.retry_count < self.config.max_retries {
            task.state = TaskState::Queued;
            task.generation += 1;
            self.queued.fetch_add(1, AtomicOrdering::SeqCst);
            let entry = QueueEntry {
                priority: task.priority,
                sequence: task.sequence,
                task_id: task.id.clone(),
                generation: task.generation,
            };
            (
                ReportDisposition::Requeued {
                    retry_count: task.retry_count,
                },
                Some(entry),
            )
        } else {
            task.state = TaskState::Failed;
            task.finished_at = Some(now);
            (ReportDisposition::Failed, None)
        }
    }

    /// Fail every in-flight attempt whose deadline has passed.
    ///
    /// Late results from those attempts are discarded by generation.
    pub fn timeout_sweep(&self, now: Instant) -> Vec<(TaskId, ReportDisposition)> {
        let expired: Vec<(TaskId, u64)> = self
            .tasks
            .iter()
            .filter(|t| t.state.is_in_flight() && t.deadline.map_or(false, |d| d <= now))
            .map(|t| (t.id.clone(), t.generation))
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for (task_id, generation) in expired {
            let outcome = TaskOutcome::Failure(DEADLINE_EXCEEDED.to_string());
            if let Ok(d) = self.report_result_for(&task_id, generation, outcome, now) {
                if d != ReportDisposition::Stale {
                    warn!(task_id = %task_id, "attempt timed out");
                    out.push((task_id, d));
                }
            }
        }
        out
    }

    /// Put a task back in the queue after its agent was released by a
    /// health transition. The retry count is unchanged.
    ///
    /// Returns `false` if the task is no longer held by `agent_id`.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownTask`] if the task is not tracked.
    pub fn requeue_released(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<bool, FleetError> {
        let entry = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| FleetError::UnknownTask {
                    task_id: task_id.clone(),
                })?;
            if !task.state.is_in_flight() || task.assigned_agent.as_ref() != Some(agent_id) {
                return Ok(false);
            }
            task.state = TaskState::Queued;
            task.assigned_agent = None;
            task.deadline = None;
            task.generation += 1;
            self.queued.fetch_add(1, AtomicOrdering::SeqCst);
            QueueEntry {
                priority: task.priority,
                sequence: task.sequence,
                task_id: task.id.clone(),
                generation: task.generation,
            }
        };
        self.queue.lock().push(entry);
        info!(task_id = %task_id, agent_id = %agent_id, "released task requeued");
        Ok(true)
    }

    /// Clone one task's record.
    pub fn get(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    /// Serializable view of one task.
    pub fn view(&self, task_id: &TaskId) -> Option<TaskView> {
        self.tasks.get(task_id).map(|t| t.view())
    }

    /// Remove and return a finished task. `Ok(None)` while still in progress.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownTask`] if the task is not tracked.
    pub fn take_result(&self, task_id: &TaskId) -> Result<Option<TaskView>, FleetError> {
        if let Some((_, task)) = self.tasks.remove_if(task_id, |_, t| t.state.is_terminal()) {
            return Ok(Some(task.view()));
        }
        if self.tasks.contains_key(task_id) {
            Ok(None)
        } else {
            Err(FleetError::UnknownTask {
                task_id: task_id.clone(),
            })
        }
    }

    /// Drop finished tasks older than `result_ttl`. Returns how many.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let ttl = self.config.result_ttl();
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !(t.state.is_terminal()
                && t.finished_at
                    .map_or(false, |at| now.saturating_duration_since(at) >= ttl))
        });
        before.saturating_sub(self.tasks.len())
    }

    /// Queued tasks per scaling type.
    pub fn queue_depth(&self) -> QueueDepth {
        let mut depth = QueueDepth::default();
        for task in self.tasks.iter() {
            if task.state != TaskState::Queued {
                continue;
            }
            match task.scaling_type() {
                Some(t) => *depth.by_type.entry(t).or_insert(0) += 1,
                None => depth.untyped += 1,
            }
        }
        depth
    }

    /// Tracked tasks by state.
    pub fn counts(&self) -> TaskCounts {
        let mut c = TaskCounts::default();
        for task in self.tasks.iter() {
            match task.state {
                TaskState::Queued => c.queued += 1,
                TaskState::Assigned => c.assigned += 1,
                TaskState::Running => c.running += 1,
                TaskState::Succeeded => c.succeeded += 1,
                TaskState::Failed => c.failed += 1,
            }
        }
        c
    }

    /// Tasks waiting for an agent.
    pub fn queued_len(&self) -> usize {
        self.queued.load(AtomicOrdering::SeqCst)
    }

    /// Tasks that reached a terminal state since creation.
    pub fn finished_total(&self) -> (u64, u64) {
        (
            self.succeeded.load(AtomicOrdering::SeqCst),
            self.failed.load(AtomicOrdering::SeqCst),
        )
    }
}
