//! Routing benchmarks: assignment throughput and eligibility lookups.
//!
//! A scheduling pass over thousands of agents must stay well under the
//! scheduler tick, or assignment latency grows with fleet size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::time::Instant;
use tokio_fleet_coordinator::agent::capability_set;
use tokio_fleet_coordinator::config::RouterConfig;
use tokio_fleet_coordinator::registry::AgentRegistry;
use tokio_fleet_coordinator::router::TaskRouter;
use tokio_fleet_coordinator::{
    AgentId, AgentType, FleetConfig, FleetCoordinator, TaskOutcome, TaskSpec,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fleet(agents: usize) -> (Arc<AgentRegistry>, TaskRouter) {
    let registry = Arc::new(AgentRegistry::new());
    for n in 0..agents {
        let role = AgentType::ALL[n % AgentType::ALL.len()];
        registry
            .register(AgentId::new(format!("agent-{n}")), role, Default::default())
            .expect("register");
    }
    let router = TaskRouter::new(
        RouterConfig {
            max_assignments_per_cycle: usize::MAX,
            ..RouterConfig::default()
        },
        registry.clone(),
    );
    (registry, router)
}

fn role_spec(n: usize) -> TaskSpec {
    let role = AgentType::ALL[n % AgentType::ALL.len()];
    TaskSpec::new([role.default_capabilities()[0]])
}

// ---------------------------------------------------------------------------
// Bench: submit → try_assign → report, one full pass
// ---------------------------------------------------------------------------

fn bench_assign_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_pass");
    group.sample_size(20);

    for agents in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("agents", agents), &agents, |b, &agents| {
            let (_registry, router) = fleet(agents);
            b.iter(|| {
                for n in 0..agents {
                    router.submit(role_spec(n)).expect("submit");
                }
                let out = router.try_assign(Instant::now());
                for a in &out.assignments {
                    let _ = router.report_result(
                        &a.task_id,
                        a.generation,
                        TaskOutcome::Success(serde_json::Value::Null),
                    );
                }
                for a in out.assignments {
                    let _ = router.take_result(&a.task_id);
                }
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: eligibility lookup
// ---------------------------------------------------------------------------

fn bench_eligible_lookup(c: &mut Criterion) {
    let (registry, _router) = fleet(10_000);
    let tags = capability_set(["security_scan"]);
    c.bench_function("eligible_ids_10k", |b| {
        b.iter(|| black_box(registry.eligible_ids(black_box(&tags), None)))
    });
}

// ---------------------------------------------------------------------------
// Bench: coordinator schedule_once with polling agents
// ---------------------------------------------------------------------------

fn bench_schedule_once(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let coordinator = Arc::new(FleetCoordinator::new(FleetConfig::default()).expect("config"));
    let agents: Vec<AgentId> = (0..1_000)
        .map(|n| {
            let id = AgentId::new(format!("poll-{n}"));
            coordinator
                .register_agent(id.clone(), AgentType::Research, Default::default())
                .expect("register");
            id
        })
        .collect();

    c.bench_function("schedule_once_1k_polling", |b| {
        b.to_async(&rt).iter(|| async {
            for _ in 0..agents.len() {
                coordinator
                    .submit_task(TaskSpec::new(["paper_summary"]))
                    .expect("submit");
            }
            black_box(coordinator.schedule_once().await);
            for id in &agents {
                if let Ok(Some(a)) = coordinator.poll_assignment(id) {
                    let _ = coordinator.report_result(
                        &a.task_id,
                        a.generation,
                        TaskOutcome::Success(serde_json::Value::Null),
                    );
                    let _ = coordinator.take_result(&a.task_id);
                }
            }
        })
    });
}

criterion_group!(benches, bench_assign_pass, bench_eligible_lookup, bench_schedule_once);
criterion_main!(benches);
