//! SQLite-backed proxy registry

use crate::error::{PoolError, PoolResult};
use crate::pool::registry::{ProxyFilter, ProxyRegistry};
use crate::proxy::models::{ProtocolSupport, ProxyRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeSet;
use std::str::FromStr;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS proxies (
    address          TEXT PRIMARY KEY NOT NULL,
    port             INTEGER NOT NULL,
    protocol_support TEXT NOT NULL,
    anonymity        TEXT NOT NULL,
    latency_secs     REAL NOT NULL,
    region           TEXT,
    score            INTEGER NOT NULL,
    disabled_domains TEXT NOT NULL DEFAULT '[]',
    checked_at       TEXT
)
"#;

const CREATE_RANK_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_proxies_rank ON proxies (score DESC, latency_secs ASC)";

const COLUMNS: &str = "address, port, protocol_support, anonymity, latency_secs, region, score, \
                       disabled_domains, checked_at";

/// Ranking order with untested (negative) latency after every measured one
const RANK_ORDER: &str = "score DESC, (latency_secs < 0) ASC, latency_secs ASC";

/// Row layout of the `proxies` table
#[derive(Debug, sqlx::FromRow)]
struct ProxyRow {
    address: String,
    port: i64,
    protocol_support: String,
    anonymity: String,
    latency_secs: f64,
    region: Option<String>,
    score: i64,
    disabled_domains: String,
    checked_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProxyRow> for ProxyRecord {
    type Error = PoolError;

    fn try_from(row: ProxyRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| PoolError::Corrupt(format!("{} for {}", what, row.address));

        let port = u16::try_from(row.port).map_err(|_| corrupt("port out of range"))?;
        let score = u32::try_from(row.score).map_err(|_| corrupt("negative score"))?;
        let protocol_support = row
            .protocol_support
            .parse()
            .map_err(|_| corrupt("unknown protocol support"))?;
        let anonymity = row.anonymity.parse().map_err(|_| corrupt("unknown anonymity"))?;
        let disabled_domains: BTreeSet<String> = serde_json::from_str(&row.disabled_domains)
            .map_err(|_| corrupt("malformed disabled domains"))?;

        Ok(ProxyRecord {
            address: row.address,
            port,
            protocol_support,
            anonymity,
            latency_secs: row.latency_secs,
            region: row.region,
            score,
            disabled_domains,
            checked_at: row.checked_at,
        })
    }
}

fn domains_json(record: &ProxyRecord) -> String {
    serde_json::to_string(&record.disabled_domains).unwrap_or_else(|_| "[]".to_string())
}

/// Registry persisted in a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Open (creating if needed) the database at `url` and ensure the schema exists
    pub async fn connect(url: &str) -> PoolResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives only as long as its single connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_RANK_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Release every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ProxyRegistry for SqliteRegistry {
    async fn upsert_if_absent(&self, record: &ProxyRecord) -> PoolResult<bool> {
        record.ensure_storable()?;
        let sql = format!(
            "INSERT INTO proxies ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(address) DO NOTHING",
            COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&record.address)
            .bind(i64::from(record.port))
            .bind(record.protocol_support.as_str())
            .bind(record.anonymity.as_str())
            .bind(record.latency_secs)
            .bind(&record.region)
            .bind(i64::from(record.score))
            .bind(domains_json(record))
            .bind(record.checked_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!("Proxy already existed: {}", record.address);
            return Ok(false);
        }
        info!("Insert success: {}", record);
        Ok(true)
    }

    async fn update(&self, record: &ProxyRecord) -> PoolResult<bool> {
        record.ensure_storable()?;
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET port = ?2,
                protocol_support = ?3,
                anonymity = ?4,
                latency_secs = ?5,
                score = ?6,
                checked_at = ?7,
                disabled_domains = (
                    SELECT json_group_array(value) FROM (
                        SELECT value FROM json_each(proxies.disabled_domains)
                        UNION
                        SELECT value FROM json_each(?8)
                    )
                )
            WHERE address = ?1
            "#,
        )
        .bind(&record.address)
        .bind(i64::from(record.port))
        .bind(record.protocol_support.as_str())
        .bind(record.anonymity.as_str())
        .bind(record.latency_secs)
        .bind(i64::from(record.score))
        .bind(record.checked_at)
        .bind(domains_json(record))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, address: &str) -> PoolResult<bool> {
        let result = sqlx::query("DELETE FROM proxies WHERE address = ?1")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, address: &str) -> PoolResult<Option<ProxyRecord>> {
        let sql = format!("SELECT {} FROM proxies WHERE address = ?1", COLUMNS);
        let row = sqlx::query_as::<_, ProxyRow>(&sql)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ProxyRecord::try_from).transpose()
    }

    fn scan_all(&self) -> BoxStream<'_, PoolResult<ProxyRecord>> {
        sqlx::query_as::<_, ProxyRow>(
            "SELECT address, port, protocol_support, anonymity, latency_secs, region, score, \
             disabled_domains, checked_at FROM proxies",
        )
        .fetch(&self.pool)
        .map(|row| row.map_err(PoolError::from).and_then(ProxyRecord::try_from))
        .boxed()
    }

    async fn query(&self, filter: &ProxyFilter, limit: Option<usize>) -> PoolResult<Vec<ProxyRecord>> {
        let accepted = ProtocolSupport::accepted_for(filter.protocol);
        let first = accepted.first().unwrap_or(&ProtocolSupport::Both);
        let second = accepted.last().unwrap_or(first);
        let limit = limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));

        let sql = format!(
            r#"
            SELECT {} FROM proxies
            WHERE protocol_support IN (?1, ?2)
              AND anonymity = ?3
              AND (?4 IS NULL OR NOT EXISTS (
                    SELECT 1 FROM json_each(proxies.disabled_domains) WHERE json_each.value = ?4))
            ORDER BY {}
            LIMIT ?5
            "#,
            COLUMNS, RANK_ORDER
        );

        let rows = sqlx::query_as::<_, ProxyRow>(&sql)
            .bind(first.as_str())
            .bind(second.as_str())
            .bind(filter.anonymity.as_str())
            .bind(filter.domain.as_deref())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ProxyRecord::try_from).collect()
    }

    async fn disable_domain(&self, address: &str, domain: &str) -> PoolResult<bool> {
        sqlx::query(
            r#"
            UPDATE proxies
            SET disabled_domains = json_insert(disabled_domains, '$[#]', ?2)
            WHERE address = ?1
              AND NOT EXISTS (
                    SELECT 1 FROM json_each(proxies.disabled_domains) WHERE json_each.value = ?2)
            "#,
        )
        .bind(address)
        .bind(domain)
        .execute(&self.pool)
        .await?;

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM proxies WHERE address = ?1)")
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn count(&self) -> PoolResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
