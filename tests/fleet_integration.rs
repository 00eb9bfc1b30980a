//! End-to-end fleet scenarios through the public coordinator API.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_fleet_coordinator::agent::capability_set;
use tokio_fleet_coordinator::config::RouterConfig;
use tokio_fleet_coordinator::registry::AgentRegistry;
use tokio_fleet_coordinator::router::{ReportDisposition, TaskRouter};
use tokio_fleet_coordinator::scale::ChannelSink;
use tokio_fleet_coordinator::{
    AgentId, AgentState, AgentType, CapabilitySet, FleetConfig, FleetCoordinator, FleetError,
    ScaleReason, SimulatedEndpoint, TaskOutcome, TaskSpec, TaskState,
};

fn coordinator(config: FleetConfig) -> Arc<FleetCoordinator> {
    Arc::new(FleetCoordinator::new(config).expect("config is valid"))
}

#[tokio::test]
async fn test_quantum_task_assigned_within_one_cycle() {
    let c = coordinator(FleetConfig::default());
    let task_id = c
        .submit_task(TaskSpec::new(["quantum"]).with_payload(json!({"n": 2})))
        .expect("submit");
    c.register_agent(
        AgentId::new("qm-1"),
        AgentType::QuantumMechanics,
        capability_set(["quantum", "relativity"]),
    )
    .expect("register");

    assert_eq!(c.task(&task_id).map(|t| t.state), Some(TaskState::Queued));
    assert_eq!(c.schedule_once().await, 1);

    let view = c.task(&task_id).expect("tracked");
    assert_eq!(view.state, TaskState::Assigned);
    assert_eq!(view.assigned_agent, Some(AgentId::new("qm-1")));
    assert_eq!(
        c.registry().state_of(&AgentId::new("qm-1")),
        Some(AgentState::Working)
    );
}

#[tokio::test]
async fn test_deregister_twice_is_idempotent() {
    let c = coordinator(FleetConfig::default());
    let id = AgentId::new("doc-1");
    c.register_agent(id.clone(), AgentType::Documentation, CapabilitySet::new())
        .expect("register");

    c.deregister_agent(&id);
    assert_eq!(c.registry().state_of(&id), Some(AgentState::Removed));
    assert_eq!(c.deregister_agent(&id), None);
    assert_eq!(c.registry().state_of(&id), Some(AgentState::Removed));

    // Heartbeats never regress a removed agent.
    let outcome = c.heartbeat(&id, None).expect("known id");
    assert_eq!(outcome.state, AgentState::Removed);
}

#[tokio::test]
async fn test_duplicate_registration_rejected_until_removed() {
    let c = coordinator(FleetConfig::default());
    let id = AgentId::new("int-1");
    c.register_agent(id.clone(), AgentType::Integration, CapabilitySet::new())
        .expect("register");
    let err = c
        .register_agent(id.clone(), AgentType::Integration, CapabilitySet::new())
        .err();
    assert!(matches!(err, Some(FleetError::DuplicateId { .. })));

    c.deregister_agent(&id);
    assert!(c
        .register_agent(id.clone(), AgentType::Integration, CapabilitySet::new())
        .is_ok());
    assert_eq!(c.registry().state_of(&id), Some(AgentState::Idle));
}

#[tokio::test]
async fn test_heartbeat_unknown_agent_errors() {
    let c = coordinator(FleetConfig::default());
    let err = c.heartbeat(&AgentId::new("nobody"), None).err();
    assert!(matches!(err, Some(FleetError::UnknownAgent { .. })));
}

#[tokio::test]
async fn test_unmatched_tags_signal_capacity_once_per_type() {
    let registry = Arc::new(AgentRegistry::new());
    let router = TaskRouter::new(
        RouterConfig {
            capacity_threshold_secs: 30,
            ..RouterConfig::default()
        },
        registry.clone(),
    );
    registry
        .register(AgentId::new("qm-1"), AgentType::QuantumMechanics, CapabilitySet::new())
        .expect("register");

    let ids: Vec<_> = (0..5)
        .map(|_| router.submit(TaskSpec::new(["dark_matter"])).expect("submit"))
        .collect();

    let t0 = Instant::now();
    let mut signals = Vec::new();
    for secs in [0, 10, 29, 31, 45, 120, 600] {
        let out = router.try_assign(t0 + Duration::from_secs(secs));
        assert!(out.assignments.is_empty());
        signals.extend(out.capacity_signals);
    }

    assert_eq!(signals.len(), 1, "one signal for the type, not one per task");
    assert_eq!(signals[0].agent_type, Some(AgentType::Cosmology));
    assert_eq!(signals[0].waiting, 5);
    for id in &ids {
        assert_eq!(router.view(id).map(|t| t.state), Some(TaskState::Queued));
    }
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeats_mark_unhealthy_and_requeue() {
    let c = coordinator(FleetConfig::default());
    let agent = AgentId::new("t-1");
    c.register_agent(agent.clone(), AgentType::Testing, CapabilitySet::new())
        .expect("register");
    let task_id = c
        .submit_task(TaskSpec::new(["load_test"]))
        .expect("submit");
    c.schedule_once().await;
    c.poll_assignment(&agent).expect("poll").expect("assignment");

    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(10)).await;
        let report = c.probe_once().await;
        assert_eq!(report.missed, 1);
        assert_eq!(c.registry().state_of(&agent), Some(AgentState::Working));
    }

    tokio::time::advance(Duration::from_secs(10)).await;
    let report = c.probe_once().await;
    assert_eq!(report.newly_unhealthy, 1);
    assert_eq!(report.released, vec![(agent.clone(), task_id.clone())]);
    assert_eq!(c.registry().state_of(&agent), Some(AgentState::Unhealthy));

    let view = c.task(&task_id).expect("tracked");
    assert_eq!(view.state, TaskState::Queued);
    assert_eq!(view.retry_count, 0, "infrastructure faults do not spend retries");

    let outcome = c.heartbeat(&agent, None).expect("heartbeat");
    assert_eq!(outcome.state, AgentState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_agent_removed_after_grace() {
    let c = coordinator(FleetConfig::default());
    let agent = AgentId::new("m-1");
    c.register_agent(agent.clone(), AgentType::Monitoring, CapabilitySet::new())
        .expect("register");

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(10)).await;
        c.probe_once().await;
    }
    assert_eq!(c.registry().state_of(&agent), Some(AgentState::Unhealthy));

    tokio::time::advance(Duration::from_secs(30)).await;
    c.probe_once().await;
    assert_eq!(c.registry().state_of(&agent), Some(AgentState::Unhealthy));

    tokio::time::advance(Duration::from_secs(30)).await;
    let report = c.probe_once().await;
    assert_eq!(report.removed, vec![agent.clone()]);
    assert_eq!(c.registry().state_of(&agent), Some(AgentState::Removed));

    let events = c.recent_events(16);
    assert!(events
        .iter()
        .any(|e| e.agent_id == agent && e.to == AgentState::Removed));
}

#[tokio::test]
async fn test_three_failures_across_agents_fail_task() {
    let c = coordinator(FleetConfig::default());
    let agents: Vec<AgentId> = (1..=3).map(|n| AgentId::new(format!("cr-{n}"))).collect();
    for id in &agents {
        c.register_agent(id.clone(), AgentType::CodeReview, CapabilitySet::new())
            .expect("register");
    }
    let task_id = c
        .submit_task(TaskSpec::new(["security_scan"]))
        .expect("submit");

    let mut tried = Vec::new();
    for attempt in 1..=3u32 {
        assert_eq!(c.schedule_once().await, 1);
        let holder = c
            .task(&task_id)
            .and_then(|t| t.assigned_agent)
            .expect("assigned");
        let assignment = c.poll_assignment(&holder).expect("poll").expect("assignment");
        let d = c
            .report_result(
                &task_id,
                assignment.generation,
                TaskOutcome::Failure(format!("lint crashed on attempt {attempt}")),
            )
            .expect("report");
        if attempt < 3 {
            assert_eq!(d, ReportDisposition::Requeued { retry_count: attempt });
        } else {
            assert_eq!(d, ReportDisposition::Failed);
        }
        tried.push(holder);
    }

    tried.sort();
    tried.dedup();
    assert_eq!(tried.len(), 3, "each retry went to a different agent");

    let view = c.task(&task_id).expect("tracked");
    assert_eq!(view.state, TaskState::Failed);
    assert_eq!(view.retry_count, 3);
    assert_eq!(view.last_failure.as_deref(), Some("lint crashed on attempt 3"));

    assert_eq!(c.schedule_once().await, 0, "failed tasks are never reassigned");
    for id in &agents {
        assert_eq!(c.registry().state_of(id), Some(AgentState::Idle));
    }
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_discards_late_result() {
    let c = coordinator(FleetConfig::default());
    let agent = AgentId::new("r-1");
    c.register_agent(agent.clone(), AgentType::Research, CapabilitySet::new())
        .expect("register");
    let task_id = c
        .submit_task(TaskSpec::new(["paper_summary"]).with_timeout(Duration::from_secs(5)))
        .expect("submit");
    c.schedule_once().await;
    let first = c.poll_assignment(&agent).expect("poll").expect("assignment");

    tokio::time::advance(Duration::from_secs(6)).await;
    c.heartbeat(&agent, None).expect("heartbeat");
    let sweep = c.sweep_once();
    assert_eq!(
        sweep.timed_out,
        vec![(task_id.clone(), ReportDisposition::Requeued { retry_count: 1 })]
    );

    let late = c
        .report_result(&task_id, first.generation, TaskOutcome::Success(json!("late")))
        .expect("report");
    assert_eq!(late, ReportDisposition::Stale);
    assert_eq!(c.task(&task_id).map(|t| t.state), Some(TaskState::Queued));
}

#[tokio::test(start_paused = true)]
async fn test_scale_triggers_within_cooldown_emit_one_intent() {
    let mut config = FleetConfig::default();
    config.router.capacity_threshold_secs = 1;
    let (sink, mut rx) = ChannelSink::new(16);
    let c = Arc::new(FleetCoordinator::with_sink(config, Arc::new(sink)).expect("valid"));

    c.submit_task(TaskSpec::new(["dark_matter"])).expect("submit");
    c.schedule_once().await;
    tokio::time::advance(Duration::from_secs(2)).await;
    c.schedule_once().await;
    let first = c.scale_once().await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].agent_type, AgentType::Cosmology);
    assert_eq!(first[0].reason, ScaleReason::Load);
    assert_eq!(first[0].desired, 1);

    // A second starved tag set of the same type, inside the cooldown.
    c.submit_task(TaskSpec::new(["redshift"])).expect("submit");
    c.schedule_once().await;
    tokio::time::advance(Duration::from_secs(2)).await;
    c.schedule_once().await;
    assert!(c.scale_once().await.is_empty());

    assert_eq!(c.scale_intents().len(), 1);
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_started_fleet_drains_work_and_shuts_down() {
    let c = coordinator(FleetConfig::default());
    let endpoints: Vec<Arc<SimulatedEndpoint>> = (0..4)
        .map(|n| {
            let id = AgentId::new(format!("an-{n}"));
            let ep = Arc::new(
                SimulatedEndpoint::new(id.clone(), Duration::from_millis(30)).with_fail_every(3),
            );
            c.register_agent_with_endpoint(id, AgentType::Analytics, CapabilitySet::new(), ep.clone())
                .expect("register");
            ep
        })
        .collect();

    let ids: Vec<_> = (0..20)
        .map(|n| {
            c.submit_task(TaskSpec::new(["metrics_aggregation"]).with_payload(json!({ "n": n })))
                .expect("submit")
        })
        .collect();

    let handle = c.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.shutdown().await;

    let snapshot = c.snapshot();
    assert_eq!(snapshot.tasks.queued + snapshot.tasks.assigned + snapshot.tasks.running, 0);
    for id in &ids {
        let state = c.task(id).map(|t| t.state);
        assert!(matches!(state, Some(TaskState::Succeeded) | Some(TaskState::Failed)));
    }
    let executed: u64 = endpoints.iter().map(|e| e.executions()).sum();
    assert!(executed >= 20);

    let stats = c.refresh_stats();
    assert_eq!(stats.tasks_succeeded + stats.tasks_failed, 20);
}
