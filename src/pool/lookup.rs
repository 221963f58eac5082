//! Lookup service: ranked listing, randomized picking and per-domain disabling

use crate::error::{PoolError, PoolResult};
use crate::pool::registry::{ProxyFilter, ProxyRegistry};
use crate::proxy::models::{AnonymityLevel, Protocol, ProxyRecord};
use log::info;
use rand::seq::IndexedRandom;
use std::sync::Arc;

/// Default number of top-ranked records a pick chooses from
pub const DEFAULT_PICK_WINDOW: usize = 50;

/// Read-side facade over the registry
#[derive(Clone)]
pub struct LookupService {
    registry: Arc<dyn ProxyRegistry>,
    window: usize,
}

impl LookupService {
    pub fn new(registry: Arc<dyn ProxyRegistry>) -> Self {
        Self {
            registry,
            window: DEFAULT_PICK_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Ranked records matching the filters, best first.
    ///
    /// `limit` of `None` returns every match.
    pub async fn list(
        &self,
        protocol: Option<Protocol>,
        domain: Option<&str>,
        anonymity: AnonymityLevel,
        limit: Option<usize>,
    ) -> PoolResult<Vec<ProxyRecord>> {
        let mut filter = ProxyFilter::new(protocol).with_anonymity(anonymity);
        if let Some(domain) = domain {
            filter = filter.with_domain(domain);
        }
        self.registry.query(&filter, limit).await
    }

    /// One record chosen uniformly from the top `window` of the ranking.
    ///
    /// `window` of `None` uses the service's configured window.
    pub async fn pick(
        &self,
        protocol: Option<Protocol>,
        domain: Option<&str>,
        anonymity: AnonymityLevel,
        window: Option<usize>,
    ) -> PoolResult<ProxyRecord> {
        let window = window.unwrap_or(self.window).max(1);
        let candidates = self.list(protocol, domain, anonymity, Some(window)).await?;
        candidates
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(PoolError::NotFound)
    }

    /// Exclude `address` from future lookups for `domain`
    pub async fn disable_domain(&self, address: &str, domain: &str) -> PoolResult<()> {
        if !self.registry.disable_domain(address, domain).await? {
            return Err(PoolError::NotFound);
        }
        info!("Disabled {} for {}", address, domain);
        Ok(())
    }
}
