//! Pool engine: registry, ingestion, maintenance sweeps and lookups

pub mod ingest;
pub mod lookup;
pub mod maintenance;
pub mod registry;
pub mod service;

pub use ingest::{HarvestReport, IngestOutcome, Ingestor};
pub use lookup::LookupService;
pub use maintenance::{Maintainer, OverlapPolicy, SweepPhase, SweepReport};
pub use registry::{rank_order, MemoryRegistry, ProxyFilter, ProxyRegistry};
pub use service::PoolService;
