//! Transfer stress harness
//!
//! Usage:
//!   cargo run --bin transfer_stress                       # in-memory store
//!   cargo run --bin transfer_stress -- --postgres         # PostgreSQL (DATABASE_URL)
//!   cargo run --bin transfer_stress -- --env ci --trials 5 --workers 32
//!
//! Exits non-zero when any invariant check fails.

use anyhow::Context;
use tracing::info;

use ordered_transfer::config::{AppConfig, StressConfig};
use ordered_transfer::db::Database;
use ordered_transfer::logging::init_logging;
use ordered_transfer::stress::{
    InMemoryBackend, PgBackend, StressBackend, run_canonical_trials, run_random_workload,
};

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|pair| names.contains(&pair[0].as_str()))
        .map(|pair| pair[1].clone())
}

fn get_usize_arg(name: &str) -> anyhow::Result<Option<usize>> {
    get_arg(&[name])
        .map(|v| v.parse().with_context(|| format!("{} expects a number", name)))
        .transpose()
}

fn use_postgres() -> bool {
    std::env::args().any(|a| a == "--postgres")
}

fn apply_overrides(stress: &mut StressConfig) -> anyhow::Result<()> {
    if let Some(trials) = get_usize_arg("--trials")? {
        stress.trials = trials;
    }
    if let Some(workers) = get_usize_arg("--workers")? {
        stress.workers = workers;
    }
    if let Some(n) = get_usize_arg("--transfers")? {
        stress.transfers_per_worker = n;
    }
    Ok(())
}

async fn run<B: StressBackend>(backend: &B, stress: &StressConfig) -> anyhow::Result<()> {
    println!("Backend: {}", backend.name());

    // 1) Stability: canonical opposing transfers, repeated
    let trials = run_canonical_trials(backend, stress.trials).await?;
    println!("Workload trials: {}", trials.trials);
    println!("Trials with errors: {}", trials.trials_with_errors);
    println!("Trials with wrong balances: {}", trials.trials_with_wrong_balances);
    println!("Avg time/trial: {:.6}s", trials.avg_per_trial().as_secs_f64());

    // 2) Random workload: conservation under contention
    let seed = rand::random::<u64>();
    let report = run_random_workload(backend, stress, seed).await?;
    println!(
        "Random workload: {} workers x {} transfers over {} accounts (seed {})",
        stress.workers, stress.transfers_per_worker, stress.accounts, seed
    );
    for (code, n) in &report.outcomes {
        println!("  {:<20} {}", code, n);
    }
    println!(
        "Total before/after: {} / {}",
        report.total_before, report.total_after
    );
    println!("Negative accounts: {}", report.negative_accounts);
    println!(
        "Elapsed: {:.3}s ({:.0} transfers/s)",
        report.elapsed.as_secs_f64(),
        report.throughput()
    );
    if let (Some(p50), Some(p99)) = (report.latency.percentile(50.0), report.latency.percentile(99.0)) {
        println!("Latency p50/p99: {}us / {}us", p50, p99);
    }

    if !trials.passed() || !report.passed() {
        anyhow::bail!("invariant check failed");
    }
    info!("All invariant checks passed");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(&get_env())?;
    let _guard = init_logging(&config);

    let mut stress = config.stress.clone();
    apply_overrides(&mut stress)?;

    if use_postgres() {
        let db = Database::connect(&config.database)
            .await
            .context("Failed to connect to PostgreSQL")?;
        db.health_check().await?;
        run(&PgBackend::new(db), &stress).await
    } else {
        let backend = InMemoryBackend::new(config.memory_store.lock_timeout());
        run(&backend, &stress).await
    }
}
