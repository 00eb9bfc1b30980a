//! # Scale Controller
//!
//! ## Responsibility
//! Turn per-type load samples and capacity signals into advisory
//! [`ScaleIntent`]s, one decision per type per cooldown.
//!
//! ## Guarantees
//! - Hysteresis: after any decision a type is left alone for `cooldown`,
//!   and watermarks must hold for `sustain_window` before they count
//! - Bounded: desired counts never leave `[min, max]` for the type, and a
//!   scale-down never goes below the number of working agents
//! - Advisory: intents are recorded and handed to a [`ScaleIntentSink`];
//!   nothing here starts or stops agents
//!
//! ## NOT Responsible For
//! - Provisioning agents (external cluster manager, behind the sink)
//! - Measuring load (see: coordinator.rs, which feeds samples)
//!
//! ## Decision order
//!
//! ```text
//! below min          → schedule  (desired = min)
//! capacity | high    → load      (desired = current + step)
//! unhealthy > thresh → health    (desired = current + unhealthy)
//! low, queue empty   → load      (desired = current - step)
//! ```

use crate::agent::AgentType;
use crate::config::ScaleConfig;
use crate::metrics;
use crate::registry::AgentCounts;
use crate::router::CapacityExhausted;
use crate::FleetError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-type controller phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalePhase {
    /// No decision in effect.
    #[default]
    Stable,
    /// An up decision is cooling down.
    ScalingUp,
    /// A down decision is cooling down.
    ScalingDown,
}

/// Why an intent was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    /// Queue pressure, capacity exhaustion or sustained idleness.
    Load,
    /// Unhealthy agents need replacing.
    Health,
    /// The type is below its configured minimum.
    Schedule,
}

impl fmt::Display for ScaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Health => write!(f, "health"),
            Self::Schedule => write!(f, "schedule"),
        }
    }
}

/// Advisory request to change the replica count of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleIntent {
    /// Role to scale.
    pub agent_type: AgentType,
    /// Live agents of that role when the decision was made.
    pub current: u32,
    /// Requested replica count.
    pub desired: u32,
    /// Why.
    pub reason: ScaleReason,
    /// When the intent was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl ScaleIntent {
    /// `up`, `down` or `replace` (health intents that keep the count).
    pub fn direction(&self) -> &'static str {
        if self.reason == ScaleReason::Health {
            "replace"
        } else if self.desired >= self.current {
            "up"
        } else {
            "down"
        }
    }
}

/// Load observed for one type at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSample {
    /// Queued tasks whose scaling type is this role.
    pub queue_depth: usize,
    /// Idle agents.
    pub idle: usize,
    /// Working agents.
    pub working: usize,
    /// Unhealthy agents.
    pub unhealthy: usize,
    /// Live agents of every state.
    pub total: usize,
}

impl LoadSample {
    /// Build a sample from registry counts and the type's queue depth.
    pub fn from_counts(counts: &AgentCounts, queue_depth: usize) -> Self {
        Self {
            queue_depth,
            idle: counts.idle,
            working: counts.working,
            unhealthy: counts.unhealthy,
            total: counts.total(),
        }
    }

    /// Queued tasks per idle agent (idle counted as at least one).
    pub fn pressure(&self) -> f64 {
        self.queue_depth as f64 / self.idle.max(1) as f64
    }

    /// Working agents over live agents; `None` with no agents.
    pub fn utilization(&self) -> Option<f64> {
        (self.total > 0).then(|| self.working as f64 / self.total as f64)
    }
}

#[derive(Debug, Default)]
struct TypeState {
    phase: ScalePhase,
    cooldown_until: Option<Instant>,
    high_since: Option<Instant>,
    low_since: Option<Instant>,
    capacity_pending: bool,
    last: Option<LoadSample>,
}

/// Per-type scale state machine with cooldown.
pub struct ScaleController {
    config: ScaleConfig,
    types: Mutex<BTreeMap<AgentType, TypeState>>,
    history: Mutex<VecDeque<ScaleIntent>>,
}

impl ScaleController {
    /// Create a controller with every type `stable`.
    pub fn new(config: ScaleConfig) -> Self {
        Self {
            config,
            types: Mutex::new(BTreeMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Scale settings.
    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    /// Record the latest load for `agent_type` and advance its watermark timers.
    pub fn observe(&self, agent_type: AgentType, sample: LoadSample, now: Instant) {
        let mut types = self.types.lock();
        let state = types.entry(agent_type).or_default();

        if sample.queue_depth > 0 && sample.pressure() > self.config.high_watermark {
            state.high_since.get_or_insert(now);
        } else {
            state.high_since = None;
        }

        let underused = sample.queue_depth == 0
            && sample
                .utilization()
                .map_or(false, |u| u < self.config.low_watermark);
        if underused {
            state.low_since.get_or_insert(now);
        } else {
            state.low_since = None;
        }

        state.last = Some(sample);
    }

    /// Note a capacity signal for the next evaluation of its type.
    ///
    /// # Errors
    ///
    /// [`FleetError::CapacityExhausted`] when the signal has no agent type,
    /// so it cannot drive a per-type decision.
    pub fn capacity_exhausted(&self, signal: &CapacityExhausted) -> Result<(), FleetError> {
        let Some(agent_type) = signal.agent_type else {
            return Err(signal.to_error());
        };
        self.types
            .lock()
            .entry(agent_type)
            .or_default()
            .capacity_pending = true;
        Ok(())
    }

    /// Decide for every observed type, returning the intents emitted now.
    pub fn evaluate(&self, now: Instant) -> Vec<ScaleIntent> {
        let mut out = Vec::new();
        let mut types = self.types.lock();
        for (agent_type, state) in types.iter_mut() {
            if let Some(until) = state.cooldown_until {
                if now < until {
                    // Signals during cooldown are absorbed by the decision in effect.
                    state.capacity_pending = false;
                    continue;
                }
                state.cooldown_until = None;
                state.phase = ScalePhase::Stable;
            }

            let Some(sample) = state.last else {
                continue;
            };
            let decision = self.decide(*agent_type, state, &sample, now);
            state.capacity_pending = false;

            let Some((desired, reason)) = decision else {
                continue;
            };
            let current = sample.total as u32;
            state.phase = if desired < current {
                ScalePhase::ScalingDown
            } else {
                ScalePhase::ScalingUp
            };
            state.cooldown_until = Some(now + self.config.cooldown());
            state.high_since = None;
            state.low_since = None;

            let intent = ScaleIntent {
                agent_type: *agent_type,
                current,
                desired,
                reason,
                emitted_at: Utc::now(),
            };
            metrics::inc_scale_intent(agent_type.as_str(), intent.direction());
            info!(
                agent_type = %agent_type,
                current,
                desired,
                reason = %reason,
                queue_depth = sample.queue_depth,
                "scale intent"
            );
            out.push(intent);
        }
        drop(types);

        if !out.is_empty() {
            let mut history = self.history.lock();
            for intent in &out {
                history.push_back(intent.clone());
            }
            while history.len() > self.config.history_len.max(1) {
                history.pop_front();
            }
        }
        out
    }

    fn decide(
        &self,
        agent_type: AgentType,
        state: &TypeState,
        sample: &LoadSample,
        now: Instant,
    ) -> Option<(u32, ScaleReason)> {
        let bounds = self.config.bounds_for(agent_type);
        let current = sample.total as u32;
        let sustain = self.config.sustain_window();
        let sustained =
            |since: Option<Instant>| since.map_or(false, |s| now.saturating_duration_since(s) >= sustain);

        if current < bounds.min {
            return Some((bounds.min, ScaleReason::Schedule));
        }

        if (state.capacity_pending || sustained(state.high_since)) && current < bounds.max {
            let step = self.step_up(current, sample.queue_depth);
            let desired = current.saturating_add(step).min(bounds.max);
            return Some((desired, ScaleReason::Load));
        }

        if sample.total > 0 && sample.unhealthy > 0 {
            let fraction = sample.unhealthy as f64 / sample.total as f64;
            if fraction > self.config.unhealthy_threshold {
                let desired = current
                    .saturating_add(sample.unhealthy as u32)
                    .min(bounds.max);
                if desired > current {
                    return Some((desired, ScaleReason::Health));
                }
            }
        }

        if sustained(state.low_since) && sample.queue_depth == 0 {
            let floor = bounds.min.max(sample.working as u32);
            let desired = current.saturating_sub(self.step(current)).max(floor);
            if desired < current {
                return Some((desired, ScaleReason::Load));
            }
        }

        debug!(agent_type = %agent_type, current, "no scale decision");
        None
    }

    fn step(&self, current: u32) -> u32 {
        let raw = (current as f64 * self.config.step_ratio).ceil() as u32;
        raw.clamp(1, self.config.max_step.max(1))
    }

    fn step_up(&self, current: u32, queue_depth: usize) -> u32 {
        if current == 0 {
            let wanted = u32::try_from(queue_depth).unwrap_or(u32::MAX);
            return wanted.clamp(1, self.config.max_step.max(1));
        }
        self.step(current)
    }

    /// Current phase of `agent_type`.
    pub fn phase(&self, agent_type: AgentType) -> ScalePhase {
        self.types
            .lock()
            .get(&agent_type)
            .map_or(ScalePhase::Stable, |s| s.phase)
    }

    /// Every retained intent, oldest first.
    pub fn intents(&self) -> Vec<ScaleIntent> {
        self.history.lock().iter().cloned().collect()
    }
}

/// Receiver of scale intents, typically an external cluster manager.
#[async_trait]
pub trait ScaleIntentSink: Send + Sync {
    /// Deliver one intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the intent could not be delivered.
    async fn publish(&self, intent: &ScaleIntent) -> Result<(), FleetError>;
}

/// Sink that only logs intents.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ScaleIntentSink for LogSink {
    async fn publish(&self, intent: &ScaleIntent) -> Result<(), FleetError> {
        info!(
            agent_type = %intent.agent_type,
            current = intent.current,
            desired = intent.desired,
            reason = %intent.reason,
            "scale intent published"
        );
        Ok(())
    }
}

/// Sink that forwards intents over a bounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ScaleIntent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScaleIntent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ScaleIntentSink for ChannelSink {
    async fn publish(&self, intent: &ScaleIntent) -> Result<(), FleetError> {
        self.tx
            .send(intent.clone())
            .await
            .map_err(|_| FleetError::Other("scale intent receiver dropped".to_string()))
    }
}
