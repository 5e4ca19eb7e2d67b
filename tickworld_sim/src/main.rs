//! Tickworld simulator CLI
//!
//! Runs the named scenarios, or a world described in a JSON file.

use clap::Parser;
use std::path::{Path, PathBuf};
use tickworld_sim::scenarios::ScenarioId;
use tickworld_sim::{ScenarioResult, ScenarioRunner, SimError, SimWorld, WorldConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Tickworld deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "tickworld-sim")]
#[command(about = "Run deterministic scheduler and routing scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (one_shot, periodic, ..., dead_ends, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: u64,

    /// Ticks for world-level scenarios, or override for --world
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Run the world described in this JSON file instead of scenarios
    #[arg(short, long)]
    world: Option<PathBuf>,

    /// Sled directory for scheduler snapshots
    #[arg(long)]
    store: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn run_world(path: &Path, args: &Args) -> Result<serde_json::Value, SimError> {
    let mut config = WorldConfig::load(path)?;
    if let Some(ticks) = args.ticks {
        config.ticks = ticks;
    }
    let ticks = config.ticks;

    let mut world = SimWorld::new(config)?;
    world.run(ticks);

    if let Some(store_path) = &args.store {
        let store = tickworld_core::SledSchedulerStore::open(store_path)?;
        let saved = world.snapshot(&store)?;
        store.flush()?;
        info!("Saved {} scheduler snapshots to {}", saved, store_path.display());
    }

    let stats = world.stats();
    Ok(serde_json::json!({
        "world": path.display().to_string(),
        "ticks": world.tick_count(),
        "machines": world.machines().count(),
        "live_schedulers": world.registry().len(),
        "tasks_fired": stats.tasks_fired,
        "packets_sent": stats.packets_sent,
        "packets_delivered": stats.packets_delivered,
        "packets_dismissed": stats.packets_dismissed,
        "total_hops": stats.total_hops,
        "routing_errors": stats.routing_errors,
    }))
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("Tickworld Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // World mode
    if let Some(path) = &args.world {
        match run_world(path, &args) {
            Ok(summary) => {
                if args.json {
                    match serde_json::to_string_pretty(&summary) {
                        Ok(text) => println!("{}", text),
                        Err(e) => error!("Failed to encode summary: {}", e),
                    }
                } else {
                    info!("✓ world {} finished: {}", path.display(), summary);
                }
            }
            Err(e) => {
                error!("✗ world {} failed: {}", path.display(), e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds.max(1) {
        let seed = args.seed.wrapping_add(seed_offset);

        let mut runner = ScenarioRunner::new(seed);
        if let Some(ticks) = args.ticks {
            runner = runner.with_ticks(ticks);
        }
        if let Some(store) = &args.store {
            runner = runner.with_store(store.join(format!("seed-{}", seed)));
        }

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "tasks_fired": r.metrics.tasks_fired,
                    "packets_sent": r.metrics.packets_sent,
                    "packets_delivered": r.metrics.packets_delivered,
                    "packets_dismissed": r.metrics.packets_dismissed,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
