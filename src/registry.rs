//! # Agent Registry
//!
//! ## Responsibility
//! Single source of truth for every agent's lifecycle state, capabilities,
//! last heartbeat and assigned task. Every state change goes through a
//! registry operation and is announced as a [`HealthEvent`].
//!
//! ## Guarantees
//! - Per-agent atomicity: each transition happens under that agent's
//!   `DashMap` entry lock, so two callers can never both claim one agent
//! - At most one task per agent: [`AgentRegistry::claim`] only succeeds
//!   from `idle`, and `release` only clears the task it is given
//! - Monotonic: `removed` is absorbing; heartbeats never resurrect it
//! - Point-in-time reads: listings clone what they need and drop the
//!   entry guards before returning
//!
//! ## NOT Responsible For
//! - Deciding when an agent is unhealthy (see: monitor.rs)
//! - Requeueing released tasks (see: router.rs, coordinator.rs)

use crate::agent::{Agent, AgentId, AgentState, AgentType, AgentView, CapabilitySet};
use crate::events::HealthEvent;
use crate::metrics;
use crate::task::TaskId;
use crate::FleetError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the health event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 16_384;

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    /// The registered id.
    pub agent_id: AgentId,
    /// The registered role.
    pub agent_type: AgentType,
    /// Effective capabilities (role defaults when none were given).
    pub capabilities: CapabilitySet,
    /// State after registration, always `idle`.
    pub state: AgentState,
}

/// Result of a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// State after the heartbeat was applied.
    pub state: AgentState,
    /// Task released because the agent reported itself unhealthy.
    pub released_task: Option<TaskId>,
}

/// Result of one missed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissOutcome {
    /// Consecutive misses after this one.
    pub missed: u32,
    /// The agent crossed the threshold on this miss.
    pub became_unhealthy: bool,
    /// Task released by the transition to `unhealthy`.
    pub released_task: Option<TaskId>,
}

/// Live agents of one type, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentCounts {
    /// Agents in `registering`.
    pub registering: usize,
    /// Agents in `idle`.
    pub idle: usize,
    /// Agents in `working`.
    pub working: usize,
    /// Agents in `unhealthy`.
    pub unhealthy: usize,
    /// Agents in `draining`.
    pub draining: usize,
}

impl AgentCounts {
    /// Every live agent.
    pub fn total(&self) -> usize {
        self.registering + self.idle + self.working + self.unhealthy + self.draining
    }

    fn add(&mut self, state: AgentState) {
        match state {
            AgentState::Registering => self.registering += 1,
            AgentState::Idle => self.idle += 1,
            AgentState::Working => self.working += 1,
            AgentState::Unhealthy => self.unhealthy += 1,
            AgentState::Draining => self.draining += 1,
            AgentState::Removed => {}
        }
    }
}

/// Apply `to` if the transition table allows it, returning the event.
fn transition(agent: &mut Agent, to: AgentState, now: Instant) -> Option<HealthEvent> {
    let from = agent.state;
    if !from.can_transition_to(to) {
        return None;
    }
    agent.state = to;
    match to {
        AgentState::Unhealthy => agent.unhealthy_since = Some(now),
        AgentState::Idle => agent.unhealthy_since = None,
        AgentState::Removed => agent.removed_at = Some(now),
        _ => {}
    }
    Some(HealthEvent::now(agent.id.clone(), agent.agent_type, from, to))
}

/// Concurrent agent table.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    events: broadcast::Sender<HealthEvent>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            agents: DashMap::new(),
            events,
        }
    }

    /// Subscribe to health events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, events: impl IntoIterator<Item = HealthEvent>) {
        for event in events {
            metrics::inc_agent_transition(&event.to.to_string());
            debug!(
                agent_id = %event.agent_id,
                agent_type = %event.agent_type,
                from = %event.from,
                to = %event.to,
                "agent transition"
            );
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    /// Register an agent and make it `idle`.
    ///
    /// Empty `capabilities` fall back to the role's defaults. A `removed`
    /// tombstone under the same id is replaced.
    ///
    /// # Errors
    ///
    /// [`FleetError::DuplicateId`] if a live agent already uses `agent_id`.
    pub fn register(
        &self,
        agent_id: AgentId,
        agent_type: AgentType,
        capabilities: CapabilitySet,
    ) -> Result<RegistrationResult, FleetError> {
        let now = Instant::now();
        let capabilities = if capabilities.is_empty() {
            agent_type.default_capability_set()
        } else {
            capabilities
        };

        let mut agent = Agent::new(agent_id.clone(), agent_type, capabilities.clone(), now);
        let event = transition(&mut agent, AgentState::Idle, now);

        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().state != AgentState::Removed {
                    return Err(FleetError::DuplicateId { agent_id });
                }
                e.insert(agent);
            }
            Entry::Vacant(v) => {
                v.insert(agent);
            }
        }

        info!(agent_id = %agent_id, agent_type = %agent_type, capabilities = capabilities.len(), "agent registered");
        self.emit(event);

        Ok(RegistrationResult {
            agent_id,
            agent_type,
            capabilities,
            state: AgentState::Idle,
        })
    }

    /// Record a heartbeat now. See [`AgentRegistry::heartbeat_at`].
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id was never registered.
    pub fn heartbeat(
        &self,
        agent_id: &AgentId,
        observed: Option<AgentState>,
    ) -> Result<HeartbeatOutcome, FleetError> {
        self.heartbeat_at(agent_id, observed, Instant::now())
    }

    /// Record a heartbeat observed at `now`.
    ///
    /// Resets the missed-probe counter. `observed` is what the agent says
    /// about itself: `None` (or `idle`/`working`, which the router owns)
    /// means no issue and recovers an `unhealthy` agent to `idle`;
    /// `unhealthy` marks it unhealthy and releases its task; `draining`
    /// starts draining. A heartbeat for a `removed` agent changes nothing.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id was never registered.
    pub fn heartbeat_at(
        &self,
        agent_id: &AgentId,
        observed: Option<AgentState>,
        now: Instant,
    ) -> Result<HeartbeatOutcome, FleetError> {
        let mut event = None;
        let outcome = {
            let mut agent =
                self.agents
                    .get_mut(agent_id)
                    .ok_or_else(|| FleetError::UnknownAgent {
                        agent_id: agent_id.clone(),
                    })?;

            if agent.state == AgentState::Removed {
                return Ok(HeartbeatOutcome {
                    state: AgentState::Removed,
                    released_task: None,
                });
            }

            agent.last_heartbeat = now;
            agent.missed_probes = 0;
            let mut released_task = None;

            match observed {
                Some(AgentState::Unhealthy) => {
                    if agent.state != AgentState::Unhealthy {
                        event = transition(&mut agent, AgentState::Unhealthy, now);
                        if event.is_some() {
                            released_task = agent.assigned_task.take();
                        }
                    }
                }
                Some(AgentState::Draining) => {
                    if agent.state != AgentState::Draining {
                        event = transition(&mut agent, AgentState::Draining, now);
                    }
                }
                Some(AgentState::Removed) | Some(AgentState::Registering) => {}
                None | Some(AgentState::Idle) | Some(AgentState::Working) => {
                    if matches!(agent.state, AgentState::Unhealthy | AgentState::Registering) {
                        event = transition(&mut agent, AgentState::Idle, now);
                        if event.is_some() {
                            info!(agent_id = %agent_id, "agent recovered");
                        }
                    }
                }
            }

            HeartbeatOutcome {
                state: agent.state,
                released_task,
            }
        };
        self.emit(event);
        Ok(outcome)
    }

    /// Move an agent to `removed`, returning the task it held.
    ///
    /// Idempotent: unknown or already removed ids return `None`.
    pub fn deregister(&self, agent_id: &AgentId) -> Option<TaskId> {
        let now = Instant::now();
        let (event, released) = {
            let mut agent = self.agents.get_mut(agent_id)?;
            if agent.state == AgentState::Removed {
                return None;
            }
            let event = transition(&mut agent, AgentState::Removed, now);
            (event, agent.assigned_task.take())
        };
        info!(agent_id = %agent_id, released_task = ?released, "agent deregistered");
        self.emit(event);
        released
    }

    /// Idle agents whose capabilities cover `tags`, most recent heartbeat first.
    pub fn list_eligible(&self, tags: &CapabilitySet) -> Vec<Agent> {
        self.list_eligible_for(tags, None)
    }

    /// Like [`AgentRegistry::list_eligible`], restricted to one role when given.
    pub fn list_eligible_for(
        &self,
        tags: &CapabilitySet,
        agent_type: Option<AgentType>,
    ) -> Vec<Agent> {
        let mut out: Vec<Agent> = self
            .agents
            .iter()
            .filter(|e| Self::is_eligible(e.value(), tags, agent_type))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| {
            b.last_heartbeat
                .cmp(&a.last_heartbeat)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Ids of eligible agents in [`AgentRegistry::list_eligible`] order.
    ///
    /// Avoids cloning capability sets on the assignment hot path.
    pub fn eligible_ids(
        &self,
        tags: &CapabilitySet,
        agent_type: Option<AgentType>,
    ) -> Vec<AgentId> {
        let mut out: Vec<(Instant, AgentId)> = self
            .agents
            .iter()
            .filter(|e| Self::is_eligible(e.value(), tags, agent_type))
            .map(|e| (e.last_heartbeat, e.id.clone()))
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        out.into_iter().map(|(_, id)| id).collect()
    }

    fn is_eligible(agent: &Agent, tags: &CapabilitySet, agent_type: Option<AgentType>) -> bool {
        agent.state.accepts_work()
            && agent_type.map_or(true, |t| t == agent.agent_type)
            && agent.has_capabilities(tags)
    }

    /// Atomically move an idle agent to `working` holding `task_id`.
    ///
    /// # Errors
    ///
    /// - [`FleetError::UnknownAgent`] if the id is not registered.
    /// - [`FleetError::AssignmentConflict`] if the agent is no longer idle.
    pub fn claim(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<(), FleetError> {
        let now = Instant::now();
        let event = {
            let mut agent =
                self.agents
                    .get_mut(agent_id)
                    .ok_or_else(|| FleetError::UnknownAgent {
                        agent_id: agent_id.clone(),
                    })?;
            if !agent.state.accepts_work() || agent.assigned_task.is_some() {
                return Err(FleetError::AssignmentConflict {
                    task_id: task_id.clone(),
                    agent_id: agent_id.clone(),
                });
            }
            let event = transition(&mut agent, AgentState::Working, now);
            agent.assigned_task = Some(task_id.clone());
            event
        };
        self.emit(event);
        Ok(())
    }

    /// Undo a [`AgentRegistry::claim`] whose task could not be bound, or
    /// detach a task from an agent that will not finish it. The agent's
    /// state only changes from `working` to `idle`.
    ///
    /// Returns `true` if the agent still held `task_id`.
    pub fn unclaim(&self, agent_id: &AgentId, task_id: &TaskId) -> bool {
        self.release_inner(agent_id, task_id, None)
    }

    /// Free an agent from `task_id` after the attempt finished.
    ///
    /// `working → idle`; an unhealthy or draining agent keeps its state.
    /// Does nothing (returns `false`) if the agent no longer holds that
    /// task, e.g. it was already released by a health transition.
    pub fn release(&self, agent_id: &AgentId, task_id: &TaskId, success: bool) -> bool {
        self.release_inner(agent_id, task_id, Some(success))
    }

    fn release_inner(&self, agent_id: &AgentId, task_id: &TaskId, success: Option<bool>) -> bool {
        let now = Instant::now();
        let event = {
            let Some(mut agent) = self.agents.get_mut(agent_id) else {
                return false;
            };
            if agent.assigned_task.as_ref() != Some(task_id) {
                return false;
            }
            agent.assigned_task = None;
            match success {
                Some(true) => agent.tasks_completed += 1,
                Some(false) => agent.tasks_failed += 1,
                None => {}
            }
            if agent.state == AgentState::Working {
                transition(&mut agent, AgentState::Idle, now)
            } else {
                None
            }
        };
        self.emit(event);
        true
    }

    /// Count one missed probe, marking the agent unhealthy at `threshold`.
    ///
    /// Returns `None` for unknown or removed agents.
    pub fn record_missed_probe(
        &self,
        agent_id: &AgentId,
        threshold: u32,
        now: Instant,
    ) -> Option<MissOutcome> {
        let (event, outcome) = {
            let mut agent = self.agents.get_mut(agent_id)?;
            if agent.state == AgentState::Removed {
                return None;
            }
            agent.missed_probes = agent.missed_probes.saturating_add(1);
            let mut event = None;
            let mut released_task = None;
            if agent.missed_probes >= threshold && agent.state != AgentState::Unhealthy {
                event = transition(&mut agent, AgentState::Unhealthy, now);
                if event.is_some() {
                    released_task = agent.assigned_task.take();
                    warn!(
                        agent_id = %agent_id,
                        missed = agent.missed_probes,
                        released_task = ?released_task,
                        "agent unhealthy after missed heartbeats"
                    );
                }
            }
            let outcome = MissOutcome {
                missed: agent.missed_probes,
                became_unhealthy: event.is_some(),
                released_task,
            };
            (event, outcome)
        };
        self.emit(event);
        Some(outcome)
    }

    /// Mark an agent unhealthy after an infrastructure fault.
    ///
    /// Returns the released task, if any.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id is not registered.
    pub fn mark_unhealthy(
        &self,
        agent_id: &AgentId,
        reason: &str,
    ) -> Result<Option<TaskId>, FleetError> {
        let now = Instant::now();
        let (event, released) = {
            let mut agent =
                self.agents
                    .get_mut(agent_id)
                    .ok_or_else(|| FleetError::UnknownAgent {
                        agent_id: agent_id.clone(),
                    })?;
            let event = transition(&mut agent, AgentState::Unhealthy, now);
            let released = if event.is_some() {
                agent.assigned_task.take()
            } else {
                None
            };
            (event, released)
        };
        if event.is_some() {
            warn!(agent_id = %agent_id, reason, released_task = ?released, "agent marked unhealthy");
        }
        self.emit(event);
        Ok(released)
    }

    /// Stop assigning work to an agent. It is removed once it holds no task.
    ///
    /// # Errors
    ///
    /// [`FleetError::UnknownAgent`] if the id is not registered.
    pub fn start_draining(&self, agent_id: &AgentId) -> Result<AgentState, FleetError> {
        let now = Instant::now();
        let (event, state) = {
            let mut agent =
                self.agents
                    .get_mut(agent_id)
                    .ok_or_else(|| FleetError::UnknownAgent {
                        agent_id: agent_id.clone(),
                    })?;
            let event = transition(&mut agent, AgentState::Draining, now);
            (event, agent.state)
        };
        self.emit(event);
        Ok(state)
    }

    /// Remove agents that are past their unhealthy grace period, and
    /// draining agents that hold no task.
    ///
    /// Returns each removed id with the task it still held.
    pub fn reap(&self, grace: Duration, now: Instant) -> Vec<(AgentId, Option<TaskId>)> {
        let mut events = Vec::new();
        let mut removed = Vec::new();
        for mut entry in self.agents.iter_mut() {
            let agent = entry.value_mut();
            let expired = match agent.state {
                AgentState::Unhealthy => agent
                    .unhealthy_since
                    .map_or(false, |since| now.saturating_duration_since(since) >= grace),
                AgentState::Draining => agent.assigned_task.is_none(),
                _ => false,
            };
            if !expired {
                continue;
            }
            if let Some(event) = transition(agent, AgentState::Removed, now) {
                events.push(event);
                removed.push((agent.id.clone(), agent.assigned_task.take()));
            }
        }
        for (id, task) in &removed {
            info!(agent_id = %id, released_task = ?task, "agent removed");
        }
        self.emit(events);
        removed
    }

    /// Drop `removed` tombstones older than `retention`. Returns how many.
    pub fn prune_removed(&self, retention: Duration, now: Instant) -> usize {
        let before = self.agents.len();
        self.agents.retain(|_, a| {
            !(a.state == AgentState::Removed
                && a.removed_at
                    .map_or(false, |at| now.saturating_duration_since(at) >= retention))
        });
        before.saturating_sub(self.agents.len())
    }

    /// Live agents to probe: id and last heartbeat.
    pub fn probe_targets(&self) -> Vec<(AgentId, Instant)> {
        self.agents
            .iter()
            .filter(|e| e.state.is_live())
            .map(|e| (e.id.clone(), e.last_heartbeat))
            .collect()
    }

    /// Clone one agent's record.
    pub fn get(&self, agent_id: &AgentId) -> Option<Agent> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    /// Current state of one agent.
    pub fn state_of(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.agents.get(agent_id).map(|a| a.state)
    }

    /// Views of every agent (removed tombstones included), sorted by id.
    pub fn snapshot(&self, now: Instant) -> Vec<AgentView> {
        let mut views: Vec<AgentView> = self.agents.iter().map(|e| e.view(now)).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Live agents per role, by state.
    pub fn counts_by_type(&self) -> BTreeMap<AgentType, AgentCounts> {
        let mut out: BTreeMap<AgentType, AgentCounts> = BTreeMap::new();
        for entry in self.agents.iter() {
            if entry.state.is_live() {
                out.entry(entry.agent_type).or_default().add(entry.state);
            }
        }
        out
    }

    /// Number of live agents.
    pub fn len(&self) -> usize {
        self.agents.iter().filter(|e| e.state.is_live()).count()
    }

    /// Returns `true` if no live agents are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::capability_set;

    fn reg_with(ids: &[(&str, AgentType, &[&str])]) -> AgentRegistry {
        let reg = AgentRegistry::new();
        for (id, t, caps) in ids {
            reg.register(AgentId::new(*id), *t, capability_set(caps.iter().copied()))
                .expect("register");
        }
        reg
    }

    #[tokio::test]
    async fn test_register_makes_agent_idle() {
        let reg = AgentRegistry::new();
        let res = reg
            .register(AgentId::new("a"), AgentType::Research, CapabilitySet::new())
            .expect("register");
        assert_eq!(res.state, AgentState::Idle);
        assert_eq!(res.capabilities, AgentType::Research.default_capability_set());
        assert_eq!(reg.state_of(&AgentId::new("a")), Some(AgentState::Idle));
    }

    #[tokio::test]
    async fn test_register_duplicate_rejected() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let err = reg
            .register(AgentId::new("a"), AgentType::Testing, CapabilitySet::new())
            .err();
        assert!(matches!(err, Some(FleetError::DuplicateId { .. })));
    }

    #[tokio::test]
    async fn test_removed_tombstone_can_reregister() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        reg.deregister(&AgentId::new("a"));
        assert!(reg
            .register(AgentId::new("a"), AgentType::Analytics, CapabilitySet::new())
            .is_ok());
        assert_eq!(
            reg.get(&AgentId::new("a")).map(|a| a.agent_type),
            Some(AgentType::Analytics)
        );
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent_errors() {
        let reg = AgentRegistry::new();
        let err = reg.heartbeat(&AgentId::new("ghost"), None).err();
        assert!(matches!(err, Some(FleetError::UnknownAgent { .. })));
    }

    #[tokio::test]
    async fn test_heartbeat_on_removed_is_noop() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        reg.deregister(&AgentId::new("a"));
        let out = reg.heartbeat(&AgentId::new("a"), None).expect("heartbeat");
        assert_eq!(out.state, AgentState::Removed);
    }

    #[tokio::test]
    async fn test_heartbeat_reporting_unhealthy_releases_task() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        let task = TaskId::new("t");
        reg.claim(&id, &task).expect("claim");
        let out = reg
            .heartbeat(&id, Some(AgentState::Unhealthy))
            .expect("heartbeat");
        assert_eq!(out.state, AgentState::Unhealthy);
        assert_eq!(out.released_task, Some(task));

        let recovered = reg.heartbeat(&id, None).expect("heartbeat");
        assert_eq!(recovered.state, AgentState::Idle);
        assert_eq!(recovered.released_task, None);
    }

    #[tokio::test]
    async fn test_heartbeat_reporting_draining_keeps_task() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        reg.claim(&id, &TaskId::new("t")).expect("claim");
        let out = reg
            .heartbeat(&id, Some(AgentState::Draining))
            .expect("heartbeat");
        assert_eq!(out.state, AgentState::Draining);
        assert_eq!(
            reg.get(&id).and_then(|a| a.assigned_task),
            Some(TaskId::new("t"))
        );
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent_and_returns_task_once() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        reg.claim(&id, &TaskId::new("t")).expect("claim");
        assert_eq!(reg.deregister(&id), Some(TaskId::new("t")));
        assert_eq!(reg.deregister(&id), None);
        assert_eq!(reg.deregister(&AgentId::new("never")), None);
        assert_eq!(reg.state_of(&id), Some(AgentState::Removed));
    }

    #[tokio::test]
    async fn test_list_eligible_requires_superset_and_idle() {
        let reg = reg_with(&[
            ("both", AgentType::QuantumMechanics, &["quantum", "relativity"]),
            ("q", AgentType::QuantumMechanics, &["quantum"]),
            ("busy", AgentType::QuantumMechanics, &["quantum", "relativity"]),
        ]);
        reg.claim(&AgentId::new("busy"), &TaskId::new("t")).expect("claim");
        let tags = capability_set(["quantum", "relativity"]);
        let ids: Vec<_> = reg.list_eligible(&tags).into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![AgentId::new("both")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_eligible_orders_by_recent_heartbeat() {
        let reg = reg_with(&[
            ("old", AgentType::Testing, &[]),
            ("new", AgentType::Testing, &[]),
        ]);
        tokio::time::advance(Duration::from_secs(1)).await;
        reg.heartbeat(&AgentId::new("new"), None).expect("heartbeat");
        let ids = reg.eligible_ids(&CapabilitySet::new(), None);
        assert_eq!(ids, vec![AgentId::new("new"), AgentId::new("old")]);
    }

    #[tokio::test]
    async fn test_list_eligible_type_filter() {
        let reg = reg_with(&[
            ("t", AgentType::Testing, &["x"]),
            ("r", AgentType::Research, &["x"]),
        ]);
        let ids = reg.eligible_ids(&capability_set(["x"]), Some(AgentType::Research));
        assert_eq!(ids, vec![AgentId::new("r")]);
    }

    #[tokio::test]
    async fn test_claim_twice_conflicts() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        assert!(reg.claim(&id, &TaskId::new("t1")).is_ok());
        let err = reg.claim(&id, &TaskId::new("t2")).err();
        assert!(matches!(err, Some(FleetError::AssignmentConflict { .. })));
    }

    #[tokio::test]
    async fn test_release_only_for_held_task() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        reg.claim(&id, &TaskId::new("t1")).expect("claim");
        assert!(!reg.release(&id, &TaskId::new("other"), true));
        assert_eq!(reg.state_of(&id), Some(AgentState::Working));
        assert!(reg.release(&id, &TaskId::new("t1"), false));
        let agent = reg.get(&id).expect("agent");
        assert_eq!(agent.state, AgentState::Idle);
        assert_eq!(agent.tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_release_keeps_unhealthy_agent_unhealthy() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        reg.claim(&id, &TaskId::new("t1")).expect("claim");
        reg.start_draining(&id).expect("drain");
        assert!(reg.release(&id, &TaskId::new("t1"), true));
        assert_eq!(reg.state_of(&id), Some(AgentState::Draining));
    }

    #[tokio::test]
    async fn test_missed_probes_cross_threshold_once() {
        let reg = reg_with(&[("a", AgentType::Testing, &[])]);
        let id = AgentId::new("a");
        reg.claim(&id, &TaskId::new("t")).expect("claim");
        let now = Instant::now();
        let m1 = reg.record_missed_probe(&id, 3, now).expect("known");
        let m2 = reg.record_missed_probe(&id, 3, now).expect("known");
        let m3 = reg.record_missed_probe(&id, 3, now).expect("known");
        let m4 = reg.record_missed_probe(&id, 3, now).expect("known");
        assert!(!m1.became_unhealthy && !m2.became_unhealthy);
        assert!(m3.became_unhealthy);
        assert_eq!(m3.released_task, Some(TaskId::new("t")));
        assert!(!m4.became_unhealthy);
        assert_eq!(m4.released_task, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_removes_after_grace_and_idle_draining() {
        let reg = reg_with(&[
            ("sick", AgentType::Testing, &[]),
            ("drain", AgentType::Testing, &[]),
            ("busy_drain", AgentType::Testing, &[]),
        ]);
        reg.mark_unhealthy(&AgentId::new("sick"), "test").expect("mark");
        reg.start_draining(&AgentId::new("drain")).expect("drain");
        reg.claim(&AgentId::new("busy_drain"), &TaskId::new("t")).expect("claim");
        reg.start_draining(&AgentId::new("busy_drain")).expect("drain");

        let grace = Duration::from_secs(60);
        let removed = reg.reap(grace, Instant::now());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, AgentId::new("drain"));

        tokio::time::advance(Duration::from_secs(61)).await;
        let removed = reg.reap(grace, Instant::now());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, AgentId::new("sick"));
        assert_eq!(reg.state_of(&AgentId::new("busy_drain")), Some(AgentState::Draining));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removed_after_retention() {
        let reg = reg_with(&[("a", AgentType::Testing, &[]), ("b", AgentType::Testing, &[])]);
        reg.deregister(&AgentId::new("a"));
        assert_eq!(reg.prune_removed(Duration::from_secs(10), Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reg.prune_removed(Duration::from_secs(10), Instant::now()), 1);
        assert!(reg.get(&AgentId::new("a")).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_emit_events() {
        let reg = AgentRegistry::new();
        let mut rx = reg.subscribe();
        reg.register(AgentId::new("a"), AgentType::Cosmology, CapabilitySet::new())
            .expect("register");
        reg.mark_unhealthy(&AgentId::new("a"), "boom").expect("mark");
        let first = rx.recv().await.expect("event");
        let second = rx.recv().await.expect("event");
        assert_eq!((first.from, first.to), (AgentState::Registering, AgentState::Idle));
        assert_eq!((second.from, second.to), (AgentState::Idle, AgentState::Unhealthy));
    }

    #[tokio::test]
    async fn test_counts_by_type_skip_removed() {
        let reg = reg_with(&[
            ("a", AgentType::Testing, &[]),
            ("b", AgentType::Testing, &[]),
            ("c", AgentType::Research, &[]),
        ]);
        reg.claim(&AgentId::new("a"), &TaskId::new("t")).expect("claim");
        reg.deregister(&AgentId::new("c"));
        let counts = reg.counts_by_type();
        let testing = counts.get(&AgentType::Testing).copied().unwrap_or_default();
        assert_eq!(testing.working, 1);
        assert_eq!(testing.idle, 1);
        assert_eq!(testing.total(), 2);
        assert!(!counts.contains_key(&AgentType::Research));
    }
}
