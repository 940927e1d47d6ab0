//! Stress Harness
//!
//! Drives the transfer engine with concurrent workloads and checks the
//! invariants afterwards.
//!
//! # Workloads
//!
//! - **Canonical trials** - five opposing transfers over accounts 1..=3,
//!   released together by a barrier; every trial must finish without errors
//!   at `{1: 800, 2: 850, 3: 1350}`
//! - **Random workload** - many workers issuing random transfers in random
//!   directions; total balance must be conserved, no balance may go
//!   negative, and no transfer may fail at the store level

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Barrier;
use tracing::{debug, info, warn};

use crate::config::StressConfig;
use crate::core_types::{AccountId, Amount};
use crate::db::Database;
use crate::store::{AccountStore, InMemoryAccountStore, PgAccountStore};
use crate::transfer::{TransferEngine, TransferRequest};

pub const CANONICAL_SEED: [(AccountId, Amount); 3] = [(1, 1000), (2, 1000), (3, 1000)];

pub const CANONICAL_TRANSFERS: [TransferRequest; 5] = [
    TransferRequest { from: 1, to: 2, amount: 300 },
    TransferRequest { from: 2, to: 1, amount: 200 },
    TransferRequest { from: 2, to: 3, amount: 400 },
    TransferRequest { from: 3, to: 2, amount: 150 },
    TransferRequest { from: 1, to: 3, amount: 100 },
];

pub const CANONICAL_FINAL: [(AccountId, Amount); 3] = [(1, 800), (2, 850), (3, 1350)];

/// A store the harness can reset and inspect between runs
#[async_trait]
pub trait StressBackend: Send + Sync {
    type Store: AccountStore + 'static;

    fn name(&self) -> &'static str;

    fn engine(&self) -> TransferEngine<Self::Store>;

    /// Replace all accounts with `accounts`
    async fn reset(&self, accounts: &[(AccountId, Amount)]) -> anyhow::Result<()>;

    async fn balances(&self) -> anyhow::Result<BTreeMap<AccountId, Amount>>;
}

/// In-process backend
pub struct InMemoryBackend {
    engine: TransferEngine<InMemoryAccountStore>,
}

impl InMemoryBackend {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            engine: TransferEngine::new(InMemoryAccountStore::new(lock_timeout)),
        }
    }
}

#[async_trait]
impl StressBackend for InMemoryBackend {
    type Store = InMemoryAccountStore;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn engine(&self) -> TransferEngine<InMemoryAccountStore> {
        self.engine.clone()
    }

    async fn reset(&self, accounts: &[(AccountId, Amount)]) -> anyhow::Result<()> {
        self.engine.store().reset(accounts.iter().copied());
        Ok(())
    }

    async fn balances(&self) -> anyhow::Result<BTreeMap<AccountId, Amount>> {
        Ok(self.engine.store().balances().await)
    }
}

/// PostgreSQL backend
pub struct PgBackend {
    db: Database,
    engine: TransferEngine<PgAccountStore>,
}

impl PgBackend {
    pub fn new(db: Database) -> Self {
        let engine = TransferEngine::new(db.account_store());
        Self { db, engine }
    }
}

#[async_trait]
impl StressBackend for PgBackend {
    type Store = PgAccountStore;

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn engine(&self) -> TransferEngine<PgAccountStore> {
        self.engine.clone()
    }

    async fn reset(&self, accounts: &[(AccountId, Amount)]) -> anyhow::Result<()> {
        self.db.reset_accounts(accounts).await?;
        Ok(())
    }

    async fn balances(&self) -> anyhow::Result<BTreeMap<AccountId, Amount>> {
        Ok(self.db.balances().await?)
    }
}

/// Latency summary in microseconds
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    samples: Vec<u64>,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        self.samples.push(latency.as_micros() as u64);
    }

    pub fn merge(&mut self, other: LatencyStats) {
        self.samples.extend(other.samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Percentile (0-100), e.g. 50.0 for median, 99.0 for P99
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }
}

#[derive(Debug, Clone)]
pub struct TrialReport {
    pub trials: usize,
    pub trials_with_errors: usize,
    pub trials_with_wrong_balances: usize,
    pub elapsed: Duration,
}

impl TrialReport {
    pub fn passed(&self) -> bool {
        self.trials_with_errors == 0 && self.trials_with_wrong_balances == 0
    }

    pub fn avg_per_trial(&self) -> Duration {
        if self.trials == 0 {
            return Duration::ZERO;
        }
        self.elapsed.div_f64(self.trials as f64)
    }
}

/// Run the five canonical opposing transfers `trials` times
pub async fn run_canonical_trials<B: StressBackend>(
    backend: &B,
    trials: usize,
) -> anyhow::Result<TrialReport> {
    let expected: BTreeMap<AccountId, Amount> = CANONICAL_FINAL.into_iter().collect();
    let mut report = TrialReport {
        trials,
        trials_with_errors: 0,
        trials_with_wrong_balances: 0,
        elapsed: Duration::ZERO,
    };

    for trial in 0..trials {
        backend.reset(&CANONICAL_SEED).await?;

        let started = Instant::now();
        let barrier = Arc::new(Barrier::new(CANONICAL_TRANSFERS.len()));
        let handles: Vec<_> = CANONICAL_TRANSFERS
            .into_iter()
            .map(|req| {
                let engine = backend.engine();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    engine.execute(&req).await
                })
            })
            .collect();

        let mut errors = 0;
        for handle in handles {
            if let Err(e) = handle.await? {
                warn!(trial, code = e.code(), error = %e, "Canonical transfer failed");
                errors += 1;
            }
        }
        report.elapsed += started.elapsed();

        if errors > 0 {
            report.trials_with_errors += 1;
        }
        let balances = backend.balances().await?;
        if balances != expected {
            warn!(trial, ?balances, "Unexpected final balances");
            report.trials_with_wrong_balances += 1;
        }
        debug!(trial, errors, "Canonical trial finished");
    }

    info!(
        backend = backend.name(),
        trials,
        trials_with_errors = report.trials_with_errors,
        "Canonical trials finished"
    );
    Ok(report)
}

/// Random transfers for each worker; never same-account, deterministic per seed
pub fn generate_workload(config: &StressConfig, seed: u64) -> Vec<Vec<TransferRequest>> {
    let accounts = config.accounts.max(2);
    let max_amount = config.max_amount.max(1);

    (0..config.workers)
        .map(|worker| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(worker as u64));
            (0..config.transfers_per_worker)
                .map(|_| {
                    let from = rng.gen_range(1..=accounts);
                    // Shift into 1..=accounts minus `from`
                    let mut to = rng.gen_range(1..accounts);
                    if to >= from {
                        to += 1;
                    }
                    TransferRequest::new(from, to, rng.gen_range(1..=max_amount))
                })
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub outcomes: BTreeMap<&'static str, usize>,
    pub total_before: i128,
    pub total_after: i128,
    pub negative_accounts: usize,
    pub elapsed: Duration,
    pub latency: LatencyStats,
}

impl WorkloadReport {
    pub fn count(&self, code: &str) -> usize {
        self.outcomes.get(code).copied().unwrap_or(0)
    }

    pub fn transfers(&self) -> usize {
        self.outcomes.values().sum()
    }

    pub fn is_conserved(&self) -> bool {
        self.total_before == self.total_after
    }

    pub fn passed(&self) -> bool {
        self.is_conserved()
            && self.negative_accounts == 0
            && self.count("STORE_FAILURE") == 0
    }

    /// Transfers per second, all outcomes included
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.transfers() as f64 / secs
    }
}

/// Run a random workload over freshly seeded accounts
pub async fn run_random_workload<B: StressBackend>(
    backend: &B,
    config: &StressConfig,
    seed: u64,
) -> anyhow::Result<WorkloadReport> {
    let seed_accounts: Vec<(AccountId, Amount)> = (1..=config.accounts.max(2))
        .map(|id| (id, config.initial_balance))
        .collect();
    backend.reset(&seed_accounts).await?;
    let total_before: i128 = seed_accounts.iter().map(|&(_, b)| b as i128).sum();

    let workload = generate_workload(config, seed);
    let barrier = Arc::new(Barrier::new(workload.len().max(1)));
    let started = Instant::now();

    let handles: Vec<_> = workload
        .into_iter()
        .map(|requests| {
            let engine = backend.engine();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
                let mut latency = LatencyStats::default();
                barrier.wait().await;
                for req in requests {
                    let issued = Instant::now();
                    let code = match engine.execute(&req).await {
                        Ok(_) => "COMMITTED",
                        Err(e) => e.code(),
                    };
                    latency.record(issued.elapsed());
                    *outcomes.entry(code).or_default() += 1;
                }
                (outcomes, latency)
            })
        })
        .collect();

    let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut latency = LatencyStats::default();
    for handle in handles {
        let (worker_outcomes, worker_latency) = handle.await?;
        for (code, n) in worker_outcomes {
            *outcomes.entry(code).or_default() += n;
        }
        latency.merge(worker_latency);
    }
    let elapsed = started.elapsed();

    let balances = backend.balances().await?;
    let report = WorkloadReport {
        outcomes,
        total_before,
        total_after: balances.values().map(|&b| b as i128).sum(),
        negative_accounts: balances.values().filter(|&&b| b < 0).count(),
        elapsed,
        latency,
    };

    info!(
        backend = backend.name(),
        transfers = report.transfers(),
        committed = report.count("COMMITTED"),
        conserved = report.is_conserved(),
        "Random workload finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> StressConfig {
        StressConfig {
            trials: 3,
            workers: 6,
            transfers_per_worker: 40,
            accounts: 3,
            initial_balance: 300,
            max_amount: 120,
        }
    }

    #[test]
    fn test_workload_never_same_account_and_in_range() {
        let config = small_config();
        let workload = generate_workload(&config, 7);
        assert_eq!(workload.len(), config.workers);
        for req in workload.iter().flatten() {
            assert_ne!(req.from, req.to);
            assert!((1..=config.accounts).contains(&req.from));
            assert!((1..=config.accounts).contains(&req.to));
            assert!((1..=config.max_amount).contains(&req.amount));
        }
    }

    #[test]
    fn test_workload_deterministic_per_seed() {
        let config = small_config();
        assert_eq!(generate_workload(&config, 1), generate_workload(&config, 1));
        assert_ne!(generate_workload(&config, 1), generate_workload(&config, 2));
    }

    #[test]
    fn test_latency_percentiles() {
        let mut stats = LatencyStats::default();
        assert_eq!(stats.percentile(50.0), None);
        for us in [10, 20, 30, 40, 50] {
            stats.record(Duration::from_micros(us));
        }
        assert_eq!(stats.percentile(0.0), Some(10));
        assert_eq!(stats.percentile(50.0), Some(30));
        assert_eq!(stats.percentile(100.0), Some(50));
    }

    #[test]
    fn test_avg_per_trial() {
        let mut report = TrialReport {
            trials: 0,
            trials_with_errors: 0,
            trials_with_wrong_balances: 0,
            elapsed: Duration::from_secs(10),
        };
        assert_eq!(report.avg_per_trial(), Duration::ZERO);

        report.trials = 4;
        assert_eq!(report.avg_per_trial(), Duration::from_millis(2500));

        // Trial counts beyond u32 must not wrap to zero
        report.trials = 1 << 32;
        assert!(report.avg_per_trial() < Duration::from_micros(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_canonical_trials_pass_in_memory() {
        let backend = InMemoryBackend::new(Duration::from_secs(2));
        let report = run_canonical_trials(&backend, 5).await.unwrap();
        assert!(report.passed(), "{:?}", report);
        assert_eq!(report.trials, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_workload_conserves_in_memory() {
        let backend = InMemoryBackend::new(Duration::from_secs(2));
        let config = small_config();
        let report = run_random_workload(&backend, &config, 42).await.unwrap();

        assert!(report.passed(), "{:?}", report.outcomes);
        assert_eq!(report.transfers(), config.workers * config.transfers_per_worker);
        assert_eq!(report.total_after, 900);
        assert_eq!(report.latency.len(), report.transfers());
    }
}
