use async_trait::async_trait;
use parking_lot::Mutex;
use proxy_pool::{
    AnonymityLevel, PoolConfig, PoolError, PoolService, Protocol, ProtocolSupport, ProxyRegistry,
    ProxyParser, SqliteRegistry, ValidationOutcome, Validator,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Passes every address in `alive`, fails everything else
#[derive(Default)]
struct Switchboard {
    alive: Mutex<HashSet<String>>,
}

impl Switchboard {
    fn up(&self, address: &str) {
        self.alive.lock().insert(address.to_string());
    }

    fn down(&self, address: &str) {
        self.alive.lock().remove(address);
    }
}

#[async_trait]
impl Validator for Switchboard {
    async fn validate(&self, address: &str, _port: u16) -> ValidationOutcome {
        if self.alive.lock().contains(address) {
            ValidationOutcome::usable(ProtocolSupport::Both, AnonymityLevel::High, 0.5)
        } else {
            ValidationOutcome::unusable()
        }
    }
}

async fn engine(max_score: u32) -> (Arc<SqliteRegistry>, Arc<Switchboard>, PoolService) {
    let store = Arc::new(SqliteRegistry::connect("sqlite::memory:").await.unwrap());
    let switchboard = Arc::new(Switchboard::default());
    let config = PoolConfig::new()
        .with_database_url("sqlite::memory:")
        .with_max_score(max_score)
        .with_sweep_concurrency(2)
        .with_sources(Vec::new())
        .with_page_delay(Duration::ZERO, Duration::ZERO);
    let service = PoolService::with_validator(config, store.clone(), switchboard.clone()).unwrap();
    (store, switchboard, service)
}

#[tokio::test]
async fn test_import_sweep_and_evict_against_sqlite() {
    let (store, switchboard, service) = engine(2).await;
    switchboard.up("10.0.0.1");
    switchboard.up("10.0.0.2");

    let candidates = ProxyParser::parse_string(
        "10.0.0.1:8080 Berlin\n10.0.0.2 3128\n# comment\n10.0.0.3:80\nnot a proxy\n",
    );
    let report = service.import(&candidates).await;
    assert_eq!(report.admitted, 2);
    assert_eq!(report.rejected, 1);
    assert_eq!(store.count().await.unwrap(), 2);

    let berlin = store.get("10.0.0.1").await.unwrap().unwrap();
    assert_eq!(berlin.score, 2);
    assert_eq!(berlin.region.as_deref(), Some("Berlin"));

    switchboard.down("10.0.0.2");
    let first = service.sweep_once().await.unwrap();
    assert_eq!(first.refreshed, 1);
    assert_eq!(first.demoted, 1);
    let demoted = store.get("10.0.0.2").await.unwrap().unwrap();
    assert_eq!(demoted.score, 1);
    assert!(demoted.latency_secs < 0.0);

    let second = service.sweep_once().await.unwrap();
    assert_eq!(second.evicted, 1);
    assert!(store.get("10.0.0.2").await.unwrap().is_none());
    assert_eq!(store.get("10.0.0.1").await.unwrap().unwrap().score, 2);
}

#[tokio::test]
async fn test_lookup_and_domain_disabling_against_sqlite() {
    let (store, switchboard, service) = engine(50).await;
    for address in ["10.0.1.1", "10.0.1.2"] {
        switchboard.up(address);
    }
    let candidates = ProxyParser::parse_string("10.0.1.1:80\n10.0.1.2:80\n");
    service.import(&candidates).await;

    let lookup = service.lookup();
    lookup.disable_domain("10.0.1.1", "example.com").await.unwrap();
    lookup.disable_domain("10.0.1.1", "example.com").await.unwrap();

    let stored = store.get("10.0.1.1").await.unwrap().unwrap();
    assert_eq!(stored.disabled_domains.len(), 1);

    let serving = lookup
        .list(Some(Protocol::Https), Some("example.com"), AnonymityLevel::High, None)
        .await
        .unwrap();
    assert_eq!(serving.len(), 1);
    assert_eq!(serving[0].address, "10.0.1.2");

    let missing = lookup.disable_domain("10.9.9.9", "example.com").await;
    assert!(matches!(missing, Err(PoolError::NotFound)));

    // A sweep must not drop the domain list.
    service.sweep_once().await.unwrap();
    let stored = store.get("10.0.1.1").await.unwrap().unwrap();
    assert!(stored.is_disabled_for("example.com"));

    let empty = lookup
        .pick(None, None, AnonymityLevel::Transparent, None)
        .await;
    assert!(matches!(empty, Err(PoolError::NotFound)));
}
