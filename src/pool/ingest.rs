//! Ingestion pipeline: validates scraped candidates and admits the usable ones

use crate::error::{PoolError, PoolResult};
use crate::pool::registry::ProxyRegistry;
use crate::proxy::checker::Validator;
use crate::proxy::crawler::{ProxyCrawler, ProxySource};
use crate::proxy::geo::GeoLocator;
use crate::proxy::models::{ProxyRecord, RawCandidate};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::ops::AddAssign;
use std::sync::Arc;

/// Default number of candidates validated at once during ingestion
pub const DEFAULT_INGEST_CONCURRENCY: usize = 10;

/// What happened to one ingested candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Validated and added to the registry
    Admitted,
    /// The address was already in the registry
    Duplicate,
    /// Failed validation on both schemes
    Rejected,
    /// Missing or invalid address or port
    Malformed,
}

/// Tally of ingestion outcomes for a batch or a whole harvest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestReport {
    pub admitted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub malformed: usize,
    /// Candidates whose ingestion hit a store error
    pub failed: usize,
}

impl HarvestReport {
    pub fn record(&mut self, outcome: &PoolResult<IngestOutcome>) {
        match outcome {
            Ok(IngestOutcome::Admitted) => self.admitted += 1,
            Ok(IngestOutcome::Duplicate) => self.duplicates += 1,
            Ok(IngestOutcome::Rejected) => self.rejected += 1,
            Ok(IngestOutcome::Malformed) => self.malformed += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.admitted + self.duplicates + self.rejected + self.malformed + self.failed
    }
}

impl AddAssign for HarvestReport {
    fn add_assign(&mut self, other: Self) {
        self.admitted += other.admitted;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        self.malformed += other.malformed;
        self.failed += other.failed;
    }
}

/// Admits validated candidates into the registry
#[derive(Clone)]
pub struct Ingestor {
    validator: Arc<dyn Validator>,
    registry: Arc<dyn ProxyRegistry>,
    max_score: u32,
    concurrency: usize,
    geo: Option<GeoLocator>,
}

impl Ingestor {
    pub fn new(validator: Arc<dyn Validator>, registry: Arc<dyn ProxyRegistry>, max_score: u32) -> Self {
        Self {
            validator,
            registry,
            max_score,
            concurrency: DEFAULT_INGEST_CONCURRENCY,
            geo: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Fill missing regions from a geo database at admission time
    pub fn with_geo_locator(mut self, geo: GeoLocator) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Validate one candidate and admit it if usable.
    ///
    /// Re-ingesting a known address is a harmless no-op. Only store failures
    /// are returned as errors.
    pub async fn ingest(&self, raw: &RawCandidate) -> PoolResult<IngestOutcome> {
        let mut candidate = match raw.parse() {
            Ok(candidate) => candidate,
            Err(PoolError::MalformedCandidate(reason)) => {
                debug!("Dropping candidate {:?}: {}", raw, reason);
                return Ok(IngestOutcome::Malformed);
            }
            Err(e) => return Err(e),
        };

        if self.registry.get(&candidate.address).await?.is_some() {
            debug!("Proxy already existed: {}", candidate.endpoint());
            return Ok(IngestOutcome::Duplicate);
        }

        let outcome = self.validator.validate(&candidate.address, candidate.port).await;
        if !outcome.is_usable() {
            debug!("Rejected {}: no usable protocol", candidate.endpoint());
            return Ok(IngestOutcome::Rejected);
        }

        if candidate.region.is_none() {
            candidate.region = self
                .geo
                .as_ref()
                .and_then(|geo| geo.region_for(&candidate.address));
        }

        let record = ProxyRecord::admitted(candidate, &outcome, self.max_score);
        if self.registry.upsert_if_absent(&record).await? {
            Ok(IngestOutcome::Admitted)
        } else {
            Ok(IngestOutcome::Duplicate)
        }
    }

    /// Ingest a burst of candidates with bounded concurrency.
    ///
    /// A failure on one candidate is logged and counted; the rest of the batch still runs.
    pub async fn ingest_batch(&self, candidates: &[RawCandidate]) -> HarvestReport {
        let outcomes = stream::iter(candidates)
            .map(|raw| async move {
                let outcome = self.ingest(raw).await;
                if let Err(e) = &outcome {
                    error!("Failed to ingest {}:{}: {}", raw.address, raw.port, e);
                }
                outcome
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut report = HarvestReport::default();
        for outcome in &outcomes {
            report.record(outcome);
        }
        report
    }

    /// Crawl one source page by page, ingesting each page as it arrives
    pub async fn harvest_source(&self, crawler: &ProxyCrawler, source: &ProxySource) -> HarvestReport {
        let mut report = HarvestReport::default();
        for url in &source.urls {
            crawler.polite_delay().await;
            let page = crawler.crawl_page(source, url).await;
            if !page.is_success() {
                continue;
            }
            let batch = self.ingest_batch(&page.candidates).await;
            info!(
                "{}: {} candidates from {}, {} admitted",
                source.name,
                page.candidates.len(),
                url,
                batch.admitted
            );
            report += batch;
        }
        report
    }

    /// Run every enabled source concurrently; sources fail independently
    pub async fn harvest(&self, crawler: &ProxyCrawler, sources: &[ProxySource]) -> HarvestReport {
        let enabled: Vec<_> = sources.iter().filter(|source| source.enabled).collect();
        if enabled.is_empty() {
            warn!("No enabled proxy sources to harvest");
            return HarvestReport::default();
        }

        info!("Harvesting {} sources", enabled.len());
        let reports = stream::iter(enabled)
            .map(|source| self.harvest_source(crawler, source))
            .buffer_unordered(sources.len().max(1))
            .collect::<Vec<_>>()
            .await;

        let mut total = HarvestReport::default();
        for report in reports {
            total += report;
        }
        info!(
            "Harvest completed: {} admitted, {} duplicates, {} rejected, {} malformed, {} failed",
            total.admitted, total.duplicates, total.rejected, total.malformed, total.failed
        );
        total
    }
}
