//! Proxy Pool - harvests, validates, scores and serves open proxies
//!
//! Candidates are crawled from listing sites, checked over HTTP and HTTPS,
//! and admitted into a registry with a score. A maintenance scheduler
//! re-validates every record on an interval and evicts the ones that keep
//! failing; lookups return the best-ranked records for a protocol and domain.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pool;
pub mod proxy;

pub use config::PoolConfig;
pub use database::SqliteRegistry;
pub use error::{PoolError, PoolResult};
pub use pool::*;
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
