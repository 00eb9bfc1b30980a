//! # Fleet Stats Cache
//!
//! ## Responsibility
//! Aggregate registry and router snapshots into dashboard-style fleet
//! stats on a cadence, and publish them as gauges.
//!
//! ## Guarantees
//! - Derived: every refresh is rebuilt from snapshots; nothing in the
//!   coordinator reads the cache for correctness
//! - Cheap reads: [`StatsCache::current`] clones the last refresh
//!
//! ## NOT Responsible For
//! - Rendering (external dashboards scrape metrics or the snapshot)

use crate::agent::{AgentState, AgentType};
use crate::metrics;
use crate::registry::{AgentCounts, AgentRegistry};
use crate::router::TaskRouter;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;

/// Per-role load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeStats {
    /// Role.
    pub agent_type: AgentType,
    /// Live agents of every state.
    pub live: usize,
    /// Idle agents.
    pub idle: usize,
    /// Working agents.
    pub working: usize,
    /// Unhealthy agents.
    pub unhealthy: usize,
    /// Draining agents.
    pub draining: usize,
    /// Queued tasks whose scaling type is this role.
    pub queued: usize,
    /// Working over live, in percent. `0.0` with no agents.
    pub utilization: f64,
}

/// Fleet-wide aggregates at one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStats {
    /// When this refresh ran.
    pub refreshed_at: DateTime<Utc>,
    /// Live agents.
    pub agents_live: usize,
    /// Queued tasks.
    pub tasks_queued: usize,
    /// Assigned or running tasks.
    pub tasks_in_flight: usize,
    /// Tasks succeeded since start.
    pub tasks_succeeded: u64,
    /// Tasks failed permanently since start.
    pub tasks_failed: u64,
    /// Finished tasks per second since the previous refresh.
    pub tasks_per_sec: f64,
    /// Succeeded over finished since start, in percent. `100.0` before any.
    pub success_rate: f64,
    /// Queued tasks with no scaling type.
    pub untyped_queued: usize,
    /// Per-role load, only roles with agents or queued work.
    pub per_type: Vec<TypeStats>,
}

impl Default for FleetStats {
    fn default() -> Self {
        Self {
            refreshed_at: Utc::now(),
            agents_live: 0,
            tasks_queued: 0,
            tasks_in_flight: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            tasks_per_sec: 0.0,
            success_rate: 100.0,
            untyped_queued: 0,
            per_type: Vec::new(),
        }
    }
}

impl FleetStats {
    /// Stats for one role, if it had agents or queued work.
    pub fn for_type(&self, agent_type: AgentType) -> Option<&TypeStats> {
        self.per_type.iter().find(|t| t.agent_type == agent_type)
    }
}

/// Last refresh plus what the rate calculation needs.
#[derive(Debug, Default)]
pub struct StatsCache {
    current: RwLock<FleetStats>,
    last_finished: Mutex<Option<(Instant, u64)>>,
}

impl StatsCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest refresh.
    pub fn current(&self) -> FleetStats {
        self.current.read().clone()
    }

    /// Rebuild stats from `registry` and `router` and update gauges.
    pub fn refresh(&self, registry: &AgentRegistry, router: &TaskRouter, now: Instant) -> FleetStats {
        let counts = registry.counts_by_type();
        let depth = router.queue_depth();
        let tasks = router.counts();
        let (succeeded, failed) = router.finished_total();
        let finished = succeeded + failed;

        let tasks_per_sec = {
            let mut last = self.last_finished.lock();
            let rate = match *last {
                Some((at, prev)) => {
                    let secs = now.saturating_duration_since(at).as_secs_f64();
                    if secs > 0.0 {
                        finished.saturating_sub(prev) as f64 / secs
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *last = Some((now, finished));
            rate
        };

        let mut per_type = Vec::new();
        for agent_type in AgentType::ALL {
            let c = counts.get(&agent_type).copied().unwrap_or_default();
            let queued = depth.by_type.get(&agent_type).copied().unwrap_or(0);
            publish_gauges(agent_type, &c, queued);
            if c.total() == 0 && queued == 0 {
                continue;
            }
            let live = c.total();
            per_type.push(TypeStats {
                agent_type,
                live,
                idle: c.idle,
                working: c.working,
                unhealthy: c.unhealthy,
                draining: c.draining,
                queued,
                utilization: if live == 0 {
                    0.0
                } else {
                    c.working as f64 / live as f64 * 100.0
                },
            });
        }
        metrics::set_queue_depth("untyped", depth.untyped as i64);

        let stats = FleetStats {
            refreshed_at: Utc::now(),
            agents_live: per_type.iter().map(|t| t.live).sum(),
            tasks_queued: tasks.queued,
            tasks_in_flight: tasks.assigned + tasks.running,
            tasks_succeeded: succeeded,
            tasks_failed: failed,
            tasks_per_sec,
            success_rate: if finished == 0 {
                100.0
            } else {
                succeeded as f64 / finished as f64 * 100.0
            },
            untyped_queued: depth.untyped,
            per_type,
        };
        *self.current.write() = stats.clone();
        stats
    }
}

fn publish_gauges(agent_type: AgentType, counts: &AgentCounts, queued: usize) {
    let t = agent_type.as_str();
    for (state, n) in [
        (AgentState::Registering, counts.registering),
        (AgentState::Idle, counts.idle),
        (AgentState::Working, counts.working),
        (AgentState::Unhealthy, counts.unhealthy),
        (AgentState::Draining, counts.draining),
    ] {
        metrics::set_agents(t, &state.to_string(), n as i64);
    }
    metrics::set_queue_depth(t, queued as i64);
}
