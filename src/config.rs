//! Runtime configuration for the pool engine

use crate::pool::ingest::DEFAULT_INGEST_CONCURRENCY;
use crate::pool::lookup::DEFAULT_PICK_WINDOW;
use crate::pool::maintenance::{OverlapPolicy, DEFAULT_SWEEP_CONCURRENCY};
use crate::proxy::checker::{CheckerConfig, DEFAULT_HTTPS_ECHO_URL, DEFAULT_HTTP_ECHO_URL, DEFAULT_TIMEOUT_SECS};
use crate::proxy::crawler::{builtin_sources, CrawlerConfig, ProxySource};
use crate::proxy::scoring::DEFAULT_MAX_SCORE;
use crate::Result;
use anyhow::bail;
use std::path::PathBuf;
use std::time::Duration;

/// Default database location
pub const DEFAULT_DATABASE_URL: &str = "sqlite://proxies.db";

/// Default period between maintenance sweeps and between harvests
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Pool engine configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-scheme timeout of one validation check
    pub validation_timeout: Duration,
    /// Score given on admission and restored on every passing check
    pub max_score: u32,
    pub sweep_interval: Duration,
    pub harvest_interval: Duration,
    /// Validations in flight during a sweep
    pub sweep_concurrency: usize,
    /// Validations in flight during ingestion
    pub ingest_concurrency: usize,
    /// How many top-ranked records `pick` chooses from
    pub pick_window: usize,
    pub database_url: String,
    pub http_echo_url: String,
    pub https_echo_url: String,
    pub overlap: OverlapPolicy,
    pub min_page_delay: Duration,
    pub max_page_delay: Duration,
    pub sources: Vec<ProxySource>,
    /// Optional MaxMind database used to fill missing regions
    pub mmdb_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let crawler = CrawlerConfig::default();
        Self {
            validation_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_score: DEFAULT_MAX_SCORE,
            sweep_interval: DEFAULT_CYCLE_INTERVAL,
            harvest_interval: DEFAULT_CYCLE_INTERVAL,
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
            ingest_concurrency: DEFAULT_INGEST_CONCURRENCY,
            pick_window: DEFAULT_PICK_WINDOW,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            http_echo_url: DEFAULT_HTTP_ECHO_URL.to_string(),
            https_echo_url: DEFAULT_HTTPS_ECHO_URL.to_string(),
            overlap: OverlapPolicy::default(),
            min_page_delay: crawler.min_page_delay,
            max_page_delay: crawler.max_page_delay,
            sources: builtin_sources(),
            mmdb_path: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    pub fn with_max_score(mut self, max_score: u32) -> Self {
        self.max_score = max_score;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_harvest_interval(mut self, interval: Duration) -> Self {
        self.harvest_interval = interval;
        self
    }

    pub fn with_sweep_concurrency(mut self, concurrency: usize) -> Self {
        self.sweep_concurrency = concurrency;
        self
    }

    pub fn with_ingest_concurrency(mut self, concurrency: usize) -> Self {
        self.ingest_concurrency = concurrency;
        self
    }

    pub fn with_pick_window(mut self, window: usize) -> Self {
        self.pick_window = window;
        self
    }

    pub fn with_echo_urls(mut self, http: impl Into<String>, https: impl Into<String>) -> Self {
        self.http_echo_url = http.into();
        self.https_echo_url = https.into();
        self
    }

    pub fn with_overlap_policy(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_page_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_page_delay = min;
        self.max_page_delay = max;
        self
    }

    pub fn with_sources(mut self, sources: Vec<ProxySource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_mmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mmdb_path = Some(path.into());
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_score == 0 {
            bail!("max score must be at least 1");
        }
        if self.sweep_concurrency == 0 || self.ingest_concurrency == 0 {
            bail!("concurrency limits must be at least 1");
        }
        if self.pick_window == 0 {
            bail!("pick window must be at least 1");
        }
        if self.min_page_delay > self.max_page_delay {
            bail!(
                "page delay range is inverted: {:?} > {:?}",
                self.min_page_delay,
                self.max_page_delay
            );
        }
        if self.sweep_interval.is_zero() || self.harvest_interval.is_zero() {
            bail!("sweep and harvest intervals must be non-zero");
        }
        Ok(())
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig::new()
            .with_timeout(self.validation_timeout)
            .with_http_echo_url(self.http_echo_url.clone())
            .with_https_echo_url(self.https_echo_url.clone())
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig::new().with_page_delay(self.min_page_delay, self.max_page_delay)
    }
}
