use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, LevelFilter};
use proxy_pool::{
    logging::init_logger,
    pool::{OverlapPolicy, PoolService, ProxyRegistry},
    proxy::{AnonymityLevel, Protocol, ProxyChecker, ProxyParser},
    PoolConfig, PoolError, SqliteRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Harvests open proxies, keeps them validated and serves the best ones
#[derive(Parser)]
#[command(name = "proxy-pool")]
#[command(about = "Harvests open proxies, keeps them validated and serves the best ones")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Database URL
    #[arg(short, long, env = "PROXY_POOL_DATABASE", default_value = "sqlite://proxies.db")]
    database: String,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, env = "PROXY_POOL_LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,

    /// Also append log lines to this file
    #[arg(long, env = "PROXY_POOL_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Timeout in seconds for each validation check
    #[arg(long, env = "PROXY_POOL_TIMEOUT", default_value = "10")]
    timeout: u64,

    /// Score given to fresh and re-validated proxies
    #[arg(long, env = "PROXY_POOL_MAX_SCORE", default_value = "50")]
    max_score: u32,

    /// Concurrent validations during a sweep
    #[arg(long, env = "PROXY_POOL_SWEEP_CONCURRENCY", default_value = "5")]
    sweep_concurrency: usize,

    /// Concurrent validations during ingestion
    #[arg(long, env = "PROXY_POOL_INGEST_CONCURRENCY", default_value = "10")]
    ingest_concurrency: usize,

    /// Number of top-ranked proxies `pick` chooses from
    #[arg(long, env = "PROXY_POOL_PICK_WINDOW", default_value = "50")]
    pick_window: usize,

    /// Seconds between maintenance sweeps
    #[arg(long, env = "PROXY_POOL_SWEEP_INTERVAL", default_value = "7200")]
    sweep_interval: u64,

    /// Seconds between harvests
    #[arg(long, env = "PROXY_POOL_HARVEST_INTERVAL", default_value = "7200")]
    harvest_interval: u64,

    /// Skip a due sweep while the previous one is still running
    #[arg(long, env = "PROXY_POOL_SKIP_OVERLAP")]
    skip_overlap: bool,

    /// Echo URL checked over plain HTTP
    #[arg(long, env = "PROXY_POOL_HTTP_ECHO_URL", default_value = "http://httpbin.org/get")]
    http_echo_url: String,

    /// Echo URL checked over HTTPS
    #[arg(long, env = "PROXY_POOL_HTTPS_ECHO_URL", default_value = "https://httpbin.org/get")]
    https_echo_url: String,

    /// MaxMind database used to fill in missing regions
    #[arg(long, env = "PROXY_POOL_MMDB")]
    mmdb: Option<PathBuf>,
}

impl Cli {
    fn pool_config(&self) -> PoolConfig {
        let overlap = if self.skip_overlap {
            OverlapPolicy::Skip
        } else {
            OverlapPolicy::Concurrent
        };
        let mut config = PoolConfig::new()
            .with_database_url(self.database.clone())
            .with_validation_timeout(Duration::from_secs(self.timeout))
            .with_max_score(self.max_score)
            .with_sweep_concurrency(self.sweep_concurrency)
            .with_ingest_concurrency(self.ingest_concurrency)
            .with_pick_window(self.pick_window)
            .with_sweep_interval(Duration::from_secs(self.sweep_interval))
            .with_harvest_interval(Duration::from_secs(self.harvest_interval))
            .with_overlap_policy(overlap)
            .with_echo_urls(self.http_echo_url.clone(), self.https_echo_url.clone());
        if let Some(path) = &self.mmdb {
            config = config.with_mmdb_path(path.clone());
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the harvest and maintenance loops until Ctrl-C (default)
    Run,
    /// Crawl every enabled source once and ingest what it finds
    Harvest,
    /// Re-validate every stored proxy once
    Sweep,
    /// Ingest proxies listed in a file
    Import {
        /// Input file containing proxies
        input: PathBuf,
    },
    /// Check a single endpoint and print the outcome
    Check {
        /// Endpoint as address:port
        endpoint: String,
    },
    /// Print one proxy chosen from the best-ranked matches
    Pick {
        #[command(flatten)]
        filter: FilterArgs,
        /// Number of top-ranked proxies to choose from (defaults to --pick-window)
        #[arg(short = 'w', long)]
        window: Option<usize>,
    },
    /// Print matching proxies as JSON, best first
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum number of proxies to print
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Stop serving a proxy for one target domain
    DisableDomain {
        /// Proxy address
        address: String,
        /// Target domain
        domain: String,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Required scheme (http, https); both when omitted
    #[arg(short, long)]
    protocol: Option<Protocol>,
    /// Skip proxies disabled for this domain
    #[arg(short, long)]
    domain: Option<String>,
    /// Anonymity level (high, anonymous, transparent)
    #[arg(short, long, default_value = "high")]
    anonymity: AnonymityLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.log_file.as_deref())?;

    let config = cli.pool_config();
    config.validate()?;

    if let Some(Commands::Check { endpoint }) = &cli.command {
        let candidate = ProxyParser::parse_line(endpoint)
            .ok_or_else(|| anyhow!("Invalid endpoint: {}", endpoint))?
            .parse()?;
        let checker = ProxyChecker::with_config(config.checker_config());
        let outcome = checker.check(&candidate.address, candidate.port).await;
        if outcome.is_usable() {
            println!(
                "{} usable: protocol={} anonymity={} latency={:.2}s",
                candidate.endpoint(),
                outcome.protocol_support,
                outcome.anonymity,
                outcome.latency_secs
            );
        } else {
            println!("{} unusable", candidate.endpoint());
        }
        return Ok(());
    }

    let store = Arc::new(SqliteRegistry::connect(&config.database_url).await?);
    let registry: Arc<dyn ProxyRegistry> = store.clone();
    let service = PoolService::new(config, registry)?;

    match cli.command {
        Some(Commands::Run) | None => {
            service
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await?;
        }
        Some(Commands::Harvest) => {
            let report = service.harvest_once().await;
            println!(
                "Harvest: {} admitted, {} duplicates, {} rejected, {} malformed, {} failed",
                report.admitted, report.duplicates, report.rejected, report.malformed, report.failed
            );
        }
        Some(Commands::Sweep) => {
            let report = service.sweep_once().await?;
            println!(
                "Sweep of {}: {} refreshed, {} demoted, {} evicted, {} failed",
                report.total, report.refreshed, report.demoted, report.evicted, report.failed
            );
        }
        Some(Commands::Import { input }) => {
            let candidates = ProxyParser::parse_file(&input)?;
            println!("Loaded {} proxies from {:?}", candidates.len(), input);
            let report = service.import(&candidates).await;
            println!(
                "Import: {} admitted, {} duplicates, {} rejected, {} malformed, {} failed",
                report.admitted, report.duplicates, report.rejected, report.malformed, report.failed
            );
        }
        Some(Commands::Pick { filter, window }) => {
            match service
                .lookup()
                .pick(filter.protocol, filter.domain.as_deref(), filter.anonymity, window)
                .await
            {
                Ok(record) => println!("{}", record.url(filter.protocol)),
                Err(PoolError::NotFound) => eprintln!("No matching proxy found"),
                Err(e) => return Err(e.into()),
            }
        }
        Some(Commands::List { filter, limit }) => {
            let records = service
                .lookup()
                .list(filter.protocol, filter.domain.as_deref(), filter.anonymity, limit)
                .await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Some(Commands::DisableDomain { address, domain }) => {
            match service.lookup().disable_domain(&address, &domain).await {
                Ok(()) => println!("Disabled {} for {}", address, domain),
                Err(PoolError::NotFound) => eprintln!("Proxy not found: {}", address),
                Err(e) => return Err(e.into()),
            }
        }
        Some(Commands::Check { .. }) => {}
    }

    store.close().await;
    Ok(())
}
