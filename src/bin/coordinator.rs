//! # Coordinator CLI: simulated fleet runner
//!
//! Registers a fleet of simulated agents, feeds it tasks from a TOML file
//! (or a synthetic mix across every role), and runs the coordinator loops
//! until the work drains or the time limit passes.
//!
//! ## Usage
//!
//! ```bash
//! # 44 agents across all roles, synthetic tasks
//! cargo run --bin coordinator -- --agents 44
//!
//! # Custom config and task file, stop after 30 seconds
//! cargo run --bin coordinator -- --config fleet.toml --tasks tasks.toml --duration 30
//!
//! # Print the initial fleet snapshot as JSON and exit
//! cargo run --bin coordinator -- --agents 8 --status
//! ```

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_fleet_coordinator::config::loader::load_from_file;
use tokio_fleet_coordinator::task::TaskFile;
use tokio_fleet_coordinator::{
    metrics, AgentId, AgentType, CapabilitySet, FleetConfig, FleetCoordinator, SimulatedEndpoint,
    TaskSpec,
};

/// Parsed CLI arguments.
struct Args {
    /// Optional fleet config file.
    config_file: Option<PathBuf>,
    /// Number of simulated agents.
    agent_count: usize,
    /// Optional tasks TOML file.
    task_file: Option<PathBuf>,
    /// Run time limit in seconds.
    duration_secs: u64,
    /// Print a snapshot and exit.
    status_only: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_file = None;
    let mut agent_count: usize = 22;
    let mut task_file = None;
    let mut duration_secs: u64 = 60;
    let mut status_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a value")?;
                config_file = Some(PathBuf::from(value));
            }
            "--agents" | "-a" => {
                i += 1;
                let value = args.get(i).ok_or("--agents requires a value")?;
                agent_count = value
                    .parse()
                    .map_err(|_| format!("invalid agent count: {value}"))?;
            }
            "--tasks" | "-t" => {
                i += 1;
                let value = args.get(i).ok_or("--tasks requires a value")?;
                task_file = Some(PathBuf::from(value));
            }
            "--duration" | "-d" => {
                i += 1;
                let value = args.get(i).ok_or("--duration requires a value")?;
                duration_secs = value
                    .parse()
                    .map_err(|_| format!("invalid duration: {value}"))?;
            }
            "--status" | "-s" => {
                status_only = true;
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{}", usage()));
            }
        }
        i += 1;
    }

    Ok(Args {
        config_file,
        agent_count,
        task_file,
        duration_secs,
        status_only,
    })
}

/// Print usage information.
fn usage() -> String {
    [
        "Usage: coordinator [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>     Fleet config TOML (default: built-in defaults)",
        "  --agents, -a <N>        Simulated agents, spread across roles (default: 22)",
        "  --tasks, -t <FILE>      Tasks TOML file (default: synthetic tasks)",
        "  --duration, -d <SECS>   Stop after this many seconds (default: 60)",
        "  --status, -s            Print the fleet snapshot as JSON and exit",
        "  --help, -h              Show this help message",
    ]
    .join("\n")
}

/// Two tasks per agent, each asking for one default capability of a role.
fn synthetic_tasks(agent_count: usize) -> Vec<TaskSpec> {
    (0..agent_count * 2)
        .map(|n| {
            let role = AgentType::ALL[n % AgentType::ALL.len()];
            let caps = role.default_capabilities();
            TaskSpec::new([caps[n % caps.len()]]).with_payload(json!({ "n": n, "role": role }))
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let _ = tokio_fleet_coordinator::init_tracing();
    if let Err(e) = metrics::init_metrics() {
        eprintln!("Metrics disabled: {e}");
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    let config = match &args.config_file {
        Some(path) => match load_from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Configuration error: {e}");
                std::process::exit(1);
            }
        },
        None => FleetConfig::default(),
    };

    let tasks = match &args.task_file {
        Some(path) => {
            let loaded = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))
                .and_then(|s| TaskFile::from_toml(&s).map_err(|e| e.to_string()));
            match loaded {
                Ok(file) => file.tasks,
                Err(e) => {
                    eprintln!("Failed to load tasks: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => synthetic_tasks(args.agent_count),
    };

    let coordinator = match FleetCoordinator::new(config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    for n in 0..args.agent_count {
        let role = AgentType::ALL[n % AgentType::ALL.len()];
        let id = AgentId::new(format!("{role}-{n}"));
        let endpoint = SimulatedEndpoint::new(id.clone(), Duration::from_millis(50 + (n as u64 % 5) * 25))
            .with_fail_every(7);
        if let Err(e) = coordinator.register_agent_with_endpoint(
            id,
            role,
            CapabilitySet::new(),
            Arc::new(endpoint),
        ) {
            eprintln!("Failed to register agent: {e}");
        }
    }

    let mut accepted = 0usize;
    for spec in tasks {
        match coordinator.submit_task(spec) {
            Ok(_) => accepted += 1,
            Err(e) => eprintln!("Task rejected: {e}"),
        }
    }

    if args.status_only {
        print_json(&coordinator.snapshot());
        return;
    }

    eprintln!(
        "Running {} agents on {} tasks (limit {}s)",
        args.agent_count, accepted, args.duration_secs
    );

    let handle = coordinator.start();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted");
                break;
            }
        }
        let counts = coordinator.router().counts();
        eprintln!("{}", coordinator.snapshot().format_status());
        if counts.queued + counts.assigned + counts.running == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!("Time limit reached");
            break;
        }
    }
    handle.shutdown().await;

    coordinator.scale_once().await;
    print_json(&json!({
        "stats": coordinator.refresh_stats(),
        "scale_intents": coordinator.scale_intents(),
    }));
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to render JSON: {e}"),
    }
}
