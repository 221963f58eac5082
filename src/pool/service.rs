//! The assembled pool engine: one registry handle shared by every component

use crate::config::PoolConfig;
use crate::error::PoolResult;
use crate::pool::ingest::{HarvestReport, Ingestor};
use crate::pool::lookup::LookupService;
use crate::pool::maintenance::{Maintainer, SweepReport};
use crate::pool::registry::ProxyRegistry;
use crate::proxy::checker::{ProxyChecker, Validator};
use crate::proxy::crawler::ProxyCrawler;
use crate::proxy::geo::GeoLocator;
use crate::proxy::models::RawCandidate;
use crate::proxy::scoring::ScoringPolicy;
use crate::Result;
use anyhow::Context;
use log::{error, info};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

/// Harvest, maintenance and lookup wired over a single registry
pub struct PoolService {
    config: PoolConfig,
    crawler: ProxyCrawler,
    ingestor: Ingestor,
    maintainer: Arc<Maintainer>,
    lookup: LookupService,
}

impl PoolService {
    /// Build the engine with the network checker as validator
    pub fn new(config: PoolConfig, registry: Arc<dyn ProxyRegistry>) -> Result<Self> {
        let checker = ProxyChecker::with_config(config.checker_config());
        Self::with_validator(config, registry, Arc::new(checker))
    }

    pub fn with_validator(
        config: PoolConfig,
        registry: Arc<dyn ProxyRegistry>,
        validator: Arc<dyn Validator>,
    ) -> Result<Self> {
        config.validate()?;

        let crawler = ProxyCrawler::with_config(config.crawler_config())?;

        let mut ingestor = Ingestor::new(Arc::clone(&validator), Arc::clone(&registry), config.max_score)
            .with_concurrency(config.ingest_concurrency);
        if let Some(path) = &config.mmdb_path {
            let geo = GeoLocator::from_path(path)
                .with_context(|| format!("Failed to open geo database {:?}", path))?;
            ingestor = ingestor.with_geo_locator(geo);
        }

        let maintainer = Maintainer::new(validator, Arc::clone(&registry), ScoringPolicy::new(config.max_score))
            .with_concurrency(config.sweep_concurrency)
            .with_overlap_policy(config.overlap);

        let lookup = LookupService::new(Arc::clone(&registry)).with_window(config.pick_window);

        Ok(Self {
            config,
            crawler,
            ingestor,
            maintainer: Arc::new(maintainer),
            lookup,
        })
    }

    pub fn maintainer(&self) -> &Arc<Maintainer> {
        &self.maintainer
    }

    pub fn lookup(&self) -> &LookupService {
        &self.lookup
    }

    /// One pass over every configured source
    pub async fn harvest_once(&self) -> HarvestReport {
        self.ingestor.harvest(&self.crawler, &self.config.sources).await
    }

    pub async fn sweep_once(&self) -> PoolResult<SweepReport> {
        self.maintainer.sweep().await
    }

    /// Ingest candidates obtained outside the crawler, e.g. from a file
    pub async fn import(&self, candidates: &[RawCandidate]) -> HarvestReport {
        self.ingestor.ingest_batch(candidates).await
    }

    /// Run the harvest and maintenance loops until `shutdown` resolves.
    ///
    /// Both loops fire once immediately. A harvest in progress at shutdown is
    /// abandoned; sweeps already running are awaited, so the registry can be
    /// closed as soon as this returns.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting proxy pool: sweep every {:?}, harvest every {:?}",
            self.config.sweep_interval, self.config.harvest_interval
        );
        let sweeper = tokio::spawn(Arc::clone(&self.maintainer).run(self.config.sweep_interval));

        let mut ticks = interval(self.config.harvest_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticks.tick() => {}
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.harvest_once() => {}
            }
        }

        info!("Shutting down proxy pool");
        self.maintainer.stop();
        if let Err(e) = sweeper.await {
            error!("Maintenance scheduler stopped abnormally: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ingest::tests::{working, ScriptedValidator};
    use crate::pool::registry::MemoryRegistry;
    use crate::proxy::models::{sample_record, AnonymityLevel};
    use std::time::Duration;

    fn quiet_config() -> PoolConfig {
        PoolConfig::new()
            .with_sources(Vec::new())
            .with_page_delay(Duration::ZERO, Duration::ZERO)
            .with_sweep_interval(Duration::from_secs(3600))
            .with_harvest_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let registry = Arc::new(MemoryRegistry::new());
        let result = PoolService::with_validator(
            quiet_config().with_pick_window(0),
            registry,
            Arc::new(ScriptedValidator::default()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_import_then_pick() {
        let registry = Arc::new(MemoryRegistry::new());
        let validator = Arc::new(ScriptedValidator::default());
        validator.set("10.1.0.1", working(0.4));
        validator.set("10.1.0.2", working(0.2));
        let service = PoolService::with_validator(quiet_config(), registry, validator).unwrap();

        let report = service
            .import(&[
                RawCandidate::new("10.1.0.1", "80", ""),
                RawCandidate::new("10.1.0.2", "80", ""),
                RawCandidate::new("10.1.0.3", "80", ""),
            ])
            .await;
        assert_eq!(report.admitted, 2);
        assert_eq!(report.rejected, 1);

        let listed = service.lookup().list(None, None, AnonymityLevel::High, None).await.unwrap();
        assert_eq!(listed[0].address, "10.1.0.2");
        let picked = service.lookup().pick(None, None, AnonymityLevel::High, None).await.unwrap();
        assert!(picked.address.starts_with("10.1.0."));
    }

    #[tokio::test]
    async fn test_run_sweeps_then_shuts_down() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.upsert_if_absent(&sample_record("10.2.0.1", 50, 0.1)).await.unwrap();
        let validator = Arc::new(ScriptedValidator::default());
        let service = PoolService::with_validator(quiet_config(), registry.clone(), validator).unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            service.run(tokio::time::sleep(Duration::from_millis(200))),
        )
        .await
        .expect("service must stop")
        .unwrap();

        let stored = registry.get("10.2.0.1").await.unwrap().unwrap();
        assert_eq!(stored.score, 49);
        assert_eq!(service.maintainer().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_sweep_settle() {
        let registry = Arc::new(MemoryRegistry::new());
        for address in ["10.3.0.1", "10.3.0.2", "10.3.0.3"] {
            registry.upsert_if_absent(&sample_record(address, 50, 0.1)).await.unwrap();
        }
        let validator = Arc::new(ScriptedValidator::with_delay(Duration::from_millis(200)));
        let config = quiet_config().with_sweep_concurrency(1);
        let service = PoolService::with_validator(config, registry.clone(), validator).unwrap();

        // Shutdown arrives while the first sweep is still on its first record.
        service
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(service.maintainer().active_sweeps(), 0);
        for address in ["10.3.0.1", "10.3.0.2", "10.3.0.3"] {
            assert_eq!(registry.get(address).await.unwrap().unwrap().score, 49);
        }
    }
}
