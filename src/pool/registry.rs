//! The proxy registry: keyed storage of records plus ranked, filtered scans

use crate::error::PoolResult;
use crate::proxy::models::{AnonymityLevel, Protocol, ProxyRecord};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{info, warn};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Which records a lookup accepts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyFilter {
    /// `None` requires both schemes
    pub protocol: Option<Protocol>,
    pub anonymity: AnonymityLevel,
    /// Records that have this domain disabled are excluded
    pub domain: Option<String>,
}

impl ProxyFilter {
    pub fn new(protocol: Option<Protocol>) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    pub fn with_anonymity(mut self, anonymity: AnonymityLevel) -> Self {
        self.anonymity = anonymity;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn matches(&self, record: &ProxyRecord) -> bool {
        record.protocol_support.satisfies(self.protocol)
            && record.anonymity == self.anonymity
            && self
                .domain
                .as_deref()
                .map_or(true, |domain| !record.is_disabled_for(domain))
    }
}

/// Ranking order: score descending, then latency ascending with untested latency last.
pub fn rank_order(a: &ProxyRecord, b: &ProxyRecord) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| latency_order(a.latency_secs, b.latency_secs))
}

fn latency_order(a: f64, b: f64) -> Ordering {
    match (a < 0.0, b < 0.0) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Keyed store of proxy records, one per address.
///
/// Every operation is atomic for a single address; nothing is locked across
/// addresses, and concurrent writers of one address resolve last-write-wins.
#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    /// Insert the record unless its address is already present.
    ///
    /// Returns `false` (and logs) for a duplicate address.
    async fn upsert_if_absent(&self, record: &ProxyRecord) -> PoolResult<bool>;

    /// Replace the stored fields of an existing record, merging disabled domains.
    ///
    /// Returns `false` when the address is unknown.
    async fn update(&self, record: &ProxyRecord) -> PoolResult<bool>;

    /// Remove a record; returns whether one was present.
    async fn delete(&self, address: &str) -> PoolResult<bool>;

    async fn get(&self, address: &str) -> PoolResult<Option<ProxyRecord>>;

    /// Lazily yield every record. Each call starts a fresh scan.
    fn scan_all(&self) -> BoxStream<'_, PoolResult<ProxyRecord>>;

    /// Records matching `filter`, in ranking order, at most `limit` of them.
    async fn query(&self, filter: &ProxyFilter, limit: Option<usize>) -> PoolResult<Vec<ProxyRecord>>;

    /// Add `domain` to the record's disabled set. A no-op for unknown addresses.
    ///
    /// Returns whether the address exists.
    async fn disable_domain(&self, address: &str, domain: &str) -> PoolResult<bool>;

    async fn count(&self) -> PoolResult<usize>;
}

/// Registry held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<String, ProxyRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProxyRegistry for MemoryRegistry {
    async fn upsert_if_absent(&self, record: &ProxyRecord) -> PoolResult<bool> {
        record.ensure_storable()?;
        let mut records = self.records.write();
        if records.contains_key(&record.address) {
            warn!("Proxy already existed: {}", record.address);
            return Ok(false);
        }
        records.insert(record.address.clone(), record.clone());
        info!("Insert success: {}", record);
        Ok(true)
    }

    async fn update(&self, record: &ProxyRecord) -> PoolResult<bool> {
        record.ensure_storable()?;
        let mut records = self.records.write();
        match records.get_mut(&record.address) {
            Some(stored) => {
                let mut domains = std::mem::take(&mut stored.disabled_domains);
                domains.extend(record.disabled_domains.iter().cloned());
                *stored = ProxyRecord {
                    region: stored.region.take(),
                    disabled_domains: domains,
                    ..record.clone()
                };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, address: &str) -> PoolResult<bool> {
        Ok(self.records.write().remove(address).is_some())
    }

    async fn get(&self, address: &str) -> PoolResult<Option<ProxyRecord>> {
        Ok(self.records.read().get(address).cloned())
    }

    fn scan_all(&self) -> BoxStream<'_, PoolResult<ProxyRecord>> {
        let snapshot: Vec<_> = self.records.read().values().cloned().collect();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn query(&self, filter: &ProxyFilter, limit: Option<usize>) -> PoolResult<Vec<ProxyRecord>> {
        let mut matched: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matched.sort_by(rank_order);
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn disable_domain(&self, address: &str, domain: &str) -> PoolResult<bool> {
        match self.records.write().get_mut(address) {
            Some(record) => {
                record.disabled_domains.insert(domain.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self) -> PoolResult<usize> {
        Ok(self.records.read().len())
    }
}
