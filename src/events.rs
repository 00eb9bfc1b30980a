//! Health events and the rolling window that keeps them.
//!
//! The registry emits one [`HealthEvent`] per lifecycle transition on a
//! broadcast channel. The coordinator drains that channel into an
//! [`EventWindow`], which forgets events older than its max age or beyond
//! its max length.

use crate::agent::{AgentId, AgentState, AgentType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// One lifecycle transition of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    /// Agent that transitioned.
    pub agent_id: AgentId,
    /// Role of that agent.
    pub agent_type: AgentType,
    /// State before the transition.
    pub from: AgentState,
    /// State after the transition.
    pub to: AgentState,
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
}

impl HealthEvent {
    /// Build an event stamped with the current wall-clock time.
    pub fn now(agent_id: AgentId, agent_type: AgentType, from: AgentState, to: AgentState) -> Self {
        Self {
            agent_id,
            agent_type,
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// Bounded, time-windowed buffer of [`HealthEvent`]s, oldest first.
#[derive(Debug)]
pub struct EventWindow {
    events: VecDeque<HealthEvent>,
    max_age: Duration,
    max_len: usize,
    dropped: u64,
}

impl EventWindow {
    /// Create an empty window.
    pub fn new(max_age: Duration, max_len: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_len.min(1024)),
            max_age,
            max_len: max_len.max(1),
            dropped: 0,
        }
    }

    /// Append an event, evicting the oldest when over `max_len`.
    pub fn push(&mut self, event: HealthEvent) {
        self.events.push_back(event);
        while self.events.len() > self.max_len {
            self.events.pop_front();
            self.dropped += 1;
        }
    }

    /// Drop events older than `max_age` relative to `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        while let Some(front) = self.events.front() {
            if now.signed_duration_since(front.at) > max_age {
                self.events.pop_front();
                self.dropped += 1;
            } else {
                break;
            }
        }
    }

    /// The newest `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<HealthEvent> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    /// Events currently held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if the window holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events evicted by age or length since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
