//! Maintenance scheduler: periodic re-validation sweeps over the whole registry

use crate::error::{PoolError, PoolResult};
use crate::pool::registry::ProxyRegistry;
use crate::proxy::checker::Validator;
use crate::proxy::models::{ProxyRecord, ValidationOutcome, UNTESTED_LATENCY};
use crate::proxy::scoring::{ScoreAction, ScoringPolicy};
use chrono::Utc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

/// Default number of validations in flight during a sweep
pub const DEFAULT_SWEEP_CONCURRENCY: usize = 5;

/// What the scheduler does when a sweep is due while another is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Start a fresh sweep with a fresh snapshot anyway
    #[default]
    Concurrent,
    /// Drop the trigger and wait for the next one
    Skip,
}

/// Phase of the most recently started sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Idle,
    Enumerating,
    Draining,
}

/// Tally of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records in the snapshot
    pub total: usize,
    /// Records that passed and were reset to the maximum score
    pub refreshed: usize,
    /// Records that failed but still have score left
    pub demoted: usize,
    pub evicted: usize,
    /// Records whose update or delete hit a store error
    pub failed: usize,
}

impl SweepReport {
    /// Records that reached a terminal outcome
    pub fn completed(&self) -> usize {
        self.refreshed + self.demoted + self.evicted + self.failed
    }
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.refreshed += other.refreshed;
        self.demoted += other.demoted;
        self.evicted += other.evicted;
        self.failed += other.failed;
    }
}

/// Apply a validation outcome to a record and persist the result
async fn settle(
    registry: &dyn ProxyRegistry,
    policy: ScoringPolicy,
    mut record: ProxyRecord,
    outcome: ValidationOutcome,
) -> PoolResult<ScoreOutcome> {
    let (score, action) = policy.apply(record.score, &outcome);
    if action == ScoreAction::Evict {
        registry.delete(&record.address).await?;
        info!("Delete proxy: {}", record);
        return Ok(ScoreOutcome::Evicted);
    }

    record.score = score;
    record.checked_at = Some(Utc::now());
    let result = if outcome.is_usable() {
        record.protocol_support = outcome.protocol_support;
        record.anonymity = outcome.anonymity;
        record.latency_secs = outcome.latency_secs;
        ScoreOutcome::Refreshed
    } else {
        // Keep the last known protocol and anonymity; only the latency is stale.
        record.latency_secs = UNTESTED_LATENCY;
        ScoreOutcome::Demoted
    };

    if !registry.update(&record).await? {
        debug!("{} was removed during the sweep", record.address);
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreOutcome {
    Refreshed,
    Demoted,
    Evicted,
}

/// Shared state of one sweep's worker pool
struct Drain {
    queue: AsyncMutex<mpsc::Receiver<ProxyRecord>>,
    validator: Arc<dyn Validator>,
    registry: Arc<dyn ProxyRegistry>,
    policy: ScoringPolicy,
    outstanding: Arc<AtomicUsize>,
}

impl Drain {
    /// Pull records until the queue is closed and empty, then exit.
    async fn work(self: Arc<Self>) -> SweepReport {
        let mut report = SweepReport::default();
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some(record) = next else {
                break;
            };

            let address = record.address.clone();
            let outcome = self.validator.validate(&record.address, record.port).await;
            match settle(self.registry.as_ref(), self.policy, record, outcome).await {
                Ok(ScoreOutcome::Refreshed) => report.refreshed += 1,
                Ok(ScoreOutcome::Demoted) => report.demoted += 1,
                Ok(ScoreOutcome::Evicted) => report.evicted += 1,
                Err(e) => {
                    error!("Failed to store check result for {}: {}", address, e);
                    report.failed += 1;
                }
            }
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        report
    }
}

/// Re-validates every record on a fixed interval with bounded concurrency
pub struct Maintainer {
    validator: Arc<dyn Validator>,
    registry: Arc<dyn ProxyRegistry>,
    policy: ScoringPolicy,
    concurrency: usize,
    overlap: OverlapPolicy,
    phase: Mutex<SweepPhase>,
    sweeping: AtomicBool,
    active_sweeps: AtomicUsize,
    outstanding: Arc<AtomicUsize>,
    /// Sweeps started by the periodic loop
    spawned: Mutex<JoinSet<()>>,
    stop_signal: Notify,
}

impl Maintainer {
    pub fn new(
        validator: Arc<dyn Validator>,
        registry: Arc<dyn ProxyRegistry>,
        policy: ScoringPolicy,
    ) -> Self {
        Self {
            validator,
            registry,
            policy,
            concurrency: DEFAULT_SWEEP_CONCURRENCY,
            overlap: OverlapPolicy::default(),
            phase: Mutex::new(SweepPhase::Idle),
            sweeping: AtomicBool::new(false),
            active_sweeps: AtomicUsize::new(0),
            outstanding: Arc::new(AtomicUsize::new(0)),
            spawned: Mutex::new(JoinSet::new()),
            stop_signal: Notify::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_overlap_policy(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn phase(&self) -> SweepPhase {
        *self.phase.lock()
    }

    pub fn active_sweeps(&self) -> usize {
        self.active_sweeps.load(Ordering::SeqCst)
    }

    /// Validations enumerated by running sweeps that have not settled yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: SweepPhase) {
        debug!("Sweep phase -> {:?}", phase);
        *self.phase.lock() = phase;
    }

    /// Snapshot the registry. Store errors abort; undecodable rows are skipped.
    async fn enumerate(&self) -> PoolResult<Vec<ProxyRecord>> {
        let mut records = Vec::new();
        let mut scan = self.registry.scan_all();
        while let Some(item) = scan.next().await {
            match item {
                Ok(record) => records.push(record),
                Err(PoolError::Corrupt(reason)) => warn!("Skipping stored record: {}", reason),
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Run one full sweep and return once every enumerated record is settled.
    pub async fn sweep(&self) -> PoolResult<SweepReport> {
        self.active_sweeps.fetch_add(1, Ordering::SeqCst);
        let result = self.run_sweep().await;
        if self.active_sweeps.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.set_phase(SweepPhase::Idle);
        }
        result
    }

    async fn run_sweep(&self) -> PoolResult<SweepReport> {
        let started = Instant::now();
        self.set_phase(SweepPhase::Enumerating);
        let records = self.enumerate().await?;
        let total = records.len();

        self.set_phase(SweepPhase::Draining);
        info!("Starting check of {} proxies", total);
        if total == 0 {
            return Ok(SweepReport::default());
        }

        let workers_wanted = self.concurrency.min(total);
        let (tx, rx) = mpsc::channel(workers_wanted);
        self.outstanding.fetch_add(total, Ordering::SeqCst);

        let drain = Arc::new(Drain {
            queue: AsyncMutex::new(rx),
            validator: Arc::clone(&self.validator),
            registry: Arc::clone(&self.registry),
            policy: self.policy,
            outstanding: Arc::clone(&self.outstanding),
        });

        let mut workers = JoinSet::new();
        for _ in 0..workers_wanted {
            workers.spawn(Arc::clone(&drain).work());
        }
        drop(drain);

        // Workers exit once the sender is dropped and the queue is empty.
        for record in records {
            if tx.send(record).await.is_err() {
                error!("All sweep workers stopped before the queue was drained");
                break;
            }
        }
        drop(tx);

        let mut report = SweepReport {
            total,
            ..SweepReport::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partial) => report += partial,
                Err(e) => error!("Sweep worker stopped abnormally: {}", e),
            }
        }

        // A worker that died mid-record leaves its count behind; settle it here.
        let unsettled = total.saturating_sub(report.completed());
        if unsettled > 0 {
            report.failed += unsettled;
            self.outstanding.fetch_sub(unsettled, Ordering::SeqCst);
        }

        info!(
            "Check completed in {:.1}s: {} refreshed, {} demoted, {} evicted, {} failed",
            started.elapsed().as_secs_f64(),
            report.refreshed,
            report.demoted,
            report.evicted,
            report.failed
        );
        Ok(report)
    }

    /// Sweep once now, then on every interval tick until `stop` is called.
    ///
    /// Returns only after every sweep it started has finished.
    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticks = interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => self.trigger(),
                _ = self.stop_signal.notified() => {
                    info!("Maintenance scheduler stopping");
                    break;
                }
            }
        }

        let mut running = std::mem::replace(&mut *self.spawned.lock(), JoinSet::new());
        if !running.is_empty() {
            info!("Waiting for {} running checks to finish", running.len());
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Proxy check task failed: {}", e);
            }
        }
    }

    /// Start a sweep in the background according to the overlap policy
    fn trigger(self: &Arc<Self>) {
        if self.overlap == OverlapPolicy::Skip && self.sweeping.swap(true, Ordering::SeqCst) {
            warn!("Previous check still running, skipping this one");
            return;
        }

        let maintainer = Arc::clone(self);
        let mut spawned = self.spawned.lock();
        while spawned.try_join_next().is_some() {}
        spawned.spawn(async move {
            if let Err(e) = maintainer.sweep().await {
                error!("Proxy check aborted: {}", e);
            }
            if maintainer.overlap == OverlapPolicy::Skip {
                maintainer.sweeping.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Stop the periodic loop; `run` then drains the sweeps it started
    pub fn stop(&self) {
        self.stop_signal.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ingest::tests::{working, ScriptedValidator};
    use crate::pool::registry::MemoryRegistry;
    use crate::proxy::models::{sample_record, AnonymityLevel, ProtocolSupport};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    async fn seeded(records: &[ProxyRecord]) -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        for record in records {
            registry.upsert_if_absent(record).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_success_resets_score() {
        let registry = seeded(&[sample_record("A", 1, 2.0)]).await;
        let validator = Arc::new(ScriptedValidator::default());
        validator.set(
            "A",
            ValidationOutcome::usable(ProtocolSupport::HttpsOnly, AnonymityLevel::Anonymous, 0.7),
        );

        let maintainer = Maintainer::new(validator, registry.clone(), ScoringPolicy::new(50));
        let report = maintainer.sweep().await.unwrap();
        assert_eq!(report.refreshed, 1);

        let stored = registry.get("A").await.unwrap().unwrap();
        assert_eq!(stored.score, 50);
        assert_eq!(stored.protocol_support, ProtocolSupport::HttpsOnly);
        assert_eq!(stored.anonymity, AnonymityLevel::Anonymous);
        assert_eq!(stored.latency_secs, 0.7);
    }

    #[tokio::test]
    async fn test_failure_decrements_and_keeps_protocol() {
        let registry = seeded(&[sample_record("A", 50, 0.3)]).await;
        let validator = Arc::new(ScriptedValidator::default());

        let maintainer = Maintainer::new(validator, registry.clone(), ScoringPolicy::new(50));
        let report = maintainer.sweep().await.unwrap();
        assert_eq!(report.demoted, 1);

        let stored = registry.get("A").await.unwrap().unwrap();
        assert_eq!(stored.score, 49);
        assert_eq!(stored.protocol_support, ProtocolSupport::Both);
        assert_eq!(stored.latency_secs, UNTESTED_LATENCY);
    }

    #[tokio::test]
    async fn test_failure_at_one_evicts() {
        let registry = seeded(&[sample_record("A", 1, 0.3), sample_record("B", 2, 0.3)]).await;
        let validator = Arc::new(ScriptedValidator::default());

        let maintainer = Maintainer::new(validator, registry.clone(), ScoringPolicy::new(50));
        let report = maintainer.sweep().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.demoted, 1);

        assert!(registry.get("A").await.unwrap().is_none());
        assert_eq!(registry.get("B").await.unwrap().unwrap().score, 1);
    }

    #[tokio::test]
    async fn test_sweep_terminates_for_any_size_and_limit() {
        for (n, k) in [(0, 1), (1, 1), (7, 1), (7, 3), (3, 10), (40, 4)] {
            let records: Vec<_> = (0..n).map(|i| sample_record(&format!("p{}", i), 3, 0.1)).collect();
            let registry = seeded(&records).await;
            let validator = Arc::new(ScriptedValidator::default());
            for i in (0..n).step_by(2) {
                validator.set(&format!("p{}", i), working(0.2));
            }

            let maintainer = Maintainer::new(validator.clone(), registry.clone(), ScoringPolicy::new(3))
                .with_concurrency(k);
            let report = tokio::time::timeout(Duration::from_secs(5), maintainer.sweep())
                .await
                .expect("sweep must terminate")
                .unwrap();

            assert_eq!(report.total, n);
            assert_eq!(report.completed(), n);
            assert_eq!(validator.calls.load(Ordering::SeqCst), n);
            assert_eq!(maintainer.outstanding(), 0);
            assert_eq!(maintainer.active_sweeps(), 0);
            assert_eq!(maintainer.phase(), SweepPhase::Idle);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_validations_never_exceed_limit() {
        let records: Vec<_> = (0..50).map(|i| sample_record(&format!("p{}", i), 5, 0.1)).collect();
        let registry = seeded(&records).await;
        let validator = Arc::new(ScriptedValidator::with_delay(Duration::from_millis(5)));

        let maintainer = Maintainer::new(validator.clone(), registry, ScoringPolicy::new(5))
            .with_concurrency(3);
        let report = maintainer.sweep().await.unwrap();

        assert_eq!(report.completed(), 50);
        let peak = validator.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 3, "peak in-flight validations was {}", peak);
    }

    #[tokio::test]
    async fn test_all_failures_drain_pool_over_sweeps() {
        let records: Vec<_> = (0..10).map(|i| sample_record(&format!("p{}", i), 2, 0.1)).collect();
        let registry = seeded(&records).await;
        let maintainer = Maintainer::new(
            Arc::new(ScriptedValidator::default()),
            registry.clone(),
            ScoringPolicy::new(2),
        )
        .with_concurrency(3);

        let first = maintainer.sweep().await.unwrap();
        assert_eq!(first.demoted, 10);
        let second = maintainer.sweep().await.unwrap();
        assert_eq!(second.evicted, 10);
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    /// Registry whose writes always fail, to check per-record isolation
    struct ReadOnlyRegistry(MemoryRegistry);

    #[async_trait]
    impl ProxyRegistry for ReadOnlyRegistry {
        async fn upsert_if_absent(&self, record: &ProxyRecord) -> PoolResult<bool> {
            self.0.upsert_if_absent(record).await
        }
        async fn update(&self, _record: &ProxyRecord) -> PoolResult<bool> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn delete(&self, _address: &str) -> PoolResult<bool> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn get(&self, address: &str) -> PoolResult<Option<ProxyRecord>> {
            self.0.get(address).await
        }
        fn scan_all(&self) -> BoxStream<'_, PoolResult<ProxyRecord>> {
            self.0.scan_all()
        }
        async fn query(
            &self,
            filter: &crate::pool::registry::ProxyFilter,
            limit: Option<usize>,
        ) -> PoolResult<Vec<ProxyRecord>> {
            self.0.query(filter, limit).await
        }
        async fn disable_domain(&self, address: &str, domain: &str) -> PoolResult<bool> {
            self.0.disable_domain(address, domain).await
        }
        async fn count(&self) -> PoolResult<usize> {
            self.0.count().await
        }
    }

    #[tokio::test]
    async fn test_store_failures_do_not_abort_sweep() {
        let inner = MemoryRegistry::new();
        for i in 0..5 {
            inner.upsert_if_absent(&sample_record(&format!("p{}", i), 1, 0.1)).await.unwrap();
        }
        let maintainer = Maintainer::new(
            Arc::new(ScriptedValidator::default()),
            Arc::new(ReadOnlyRegistry(inner)),
            ScoringPolicy::new(50),
        )
        .with_concurrency(2);

        let report = maintainer.sweep().await.unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.failed, 5);
        assert_eq!(maintainer.outstanding(), 0);
    }

    /// Registry that cannot be scanned at all
    struct UnreachableRegistry;

    #[async_trait]
    impl ProxyRegistry for UnreachableRegistry {
        async fn upsert_if_absent(&self, _record: &ProxyRecord) -> PoolResult<bool> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn update(&self, _record: &ProxyRecord) -> PoolResult<bool> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn delete(&self, _address: &str) -> PoolResult<bool> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn get(&self, _address: &str) -> PoolResult<Option<ProxyRecord>> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        fn scan_all(&self) -> BoxStream<'_, PoolResult<ProxyRecord>> {
            stream::once(async { Err(PoolError::Store(sqlx::Error::PoolClosed)) }).boxed()
        }
        async fn query(
            &self,
            _filter: &crate::pool::registry::ProxyFilter,
            _limit: Option<usize>,
        ) -> PoolResult<Vec<ProxyRecord>> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn disable_domain(&self, _address: &str, _domain: &str) -> PoolResult<bool> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
        async fn count(&self) -> PoolResult<usize> {
            Err(PoolError::Store(sqlx::Error::PoolClosed))
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal_to_sweep() {
        let maintainer = Maintainer::new(
            Arc::new(ScriptedValidator::default()),
            Arc::new(UnreachableRegistry),
            ScoringPolicy::default(),
        );
        let result = maintainer.sweep().await;
        assert!(matches!(result, Err(e) if e.is_retriable()));
        assert_eq!(maintainer.phase(), SweepPhase::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_settle_every_record() {
        let records: Vec<_> = (0..6).map(|i| sample_record(&format!("p{}", i), 50, 0.1)).collect();
        let registry = seeded(&records).await;
        let validator = Arc::new(ScriptedValidator::default());
        for i in 0..6 {
            validator.set(&format!("p{}", i), working(0.3));
        }
        let maintainer = Maintainer::new(validator, registry.clone(), ScoringPolicy::new(50))
            .with_concurrency(2);

        let (a, b) = tokio::join!(maintainer.sweep(), maintainer.sweep());
        assert_eq!(a.unwrap().refreshed, 6);
        assert_eq!(b.unwrap().refreshed, 6);
        assert_eq!(registry.count().await.unwrap(), 6);
        assert_eq!(maintainer.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_run_sweeps_immediately_and_stops() {
        let registry = seeded(&[sample_record("A", 50, 0.3)]).await;
        let validator = Arc::new(ScriptedValidator::default());
        let maintainer = Arc::new(
            Maintainer::new(validator.clone(), registry.clone(), ScoringPolicy::new(50))
                .with_overlap_policy(OverlapPolicy::Skip),
        );

        let handle = tokio::spawn(Arc::clone(&maintainer).run(Duration::from_secs(3600)));
        for _ in 0..100 {
            if validator.calls.load(Ordering::SeqCst) > 0 && maintainer.active_sweeps() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        maintainer.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler must stop")
            .unwrap();

        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("A").await.unwrap().unwrap().score, 49);
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_sweep() {
        let registry = seeded(&[sample_record("A", 50, 0.3), sample_record("B", 50, 0.3)]).await;
        let validator = Arc::new(ScriptedValidator::with_delay(Duration::from_millis(300)));
        let maintainer = Arc::new(
            Maintainer::new(validator.clone(), registry.clone(), ScoringPolicy::new(50))
                .with_concurrency(1),
        );

        let handle = tokio::spawn(Arc::clone(&maintainer).run(Duration::from_secs(3600)));
        while validator.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        maintainer.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler must stop")
            .unwrap();

        assert_eq!(maintainer.active_sweeps(), 0);
        assert_eq!(maintainer.outstanding(), 0);
        assert_eq!(registry.get("A").await.unwrap().unwrap().score, 49);
        assert_eq!(registry.get("B").await.unwrap().unwrap().score, 49);
    }
}
