//! Proxy crawler module for fetching candidates from listing sites
//!
//! This module provides functionality for:
//! - Describing listing sites as data (page URLs plus an extraction rule)
//! - Fetching pages politely, with a randomised pause between requests
//! - Extracting raw (address, port, region) candidates from each page

use crate::proxy::models::RawCandidate;
use crate::proxy::parser::ProxyParser;
use crate::Result;
use anyhow::{anyhow, Context};
use log::{debug, warn};
use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use rand::Rng;
use regex::Regex;
use reqwest::{header, Client};
use serde_json::Value;
use std::time::Duration;

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Browser user agents rotated across requests
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:90.0) Gecko/20100101 Firefox/90.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.107 Safari/537.36",
];

/// Regex pattern to match IP:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Pick a user agent at random for the next request.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// How candidates are pulled out of a fetched page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractRule {
    /// One candidate per line, falling back to any IP:PORT found in the text
    PlainList,
    /// Regex with named groups `ip`, `port` and optionally `region`
    Regex { pattern: String },
    /// The first capture group of `pattern` is a JSON array of objects
    EmbeddedJson {
        pattern: String,
        ip_field: String,
        port_field: String,
        region_field: String,
    },
}

impl ExtractRule {
    /// Extract raw candidates from a page body.
    pub fn extract(&self, content: &str) -> Result<Vec<RawCandidate>> {
        match self {
            ExtractRule::PlainList => Ok(extract_plain_list(content)),
            ExtractRule::Regex { pattern } => {
                let re = Regex::new(pattern).with_context(|| format!("invalid pattern {}", pattern))?;
                Ok(re
                    .captures_iter(content)
                    .filter_map(|cap| {
                        let ip = cap.name("ip")?.as_str().trim();
                        let port = cap.name("port")?.as_str().trim();
                        let region = cap.name("region").map_or("", |m| m.as_str().trim());
                        Some(RawCandidate::new(ip, port, region))
                    })
                    .collect())
            }
            ExtractRule::EmbeddedJson {
                pattern,
                ip_field,
                port_field,
                region_field,
            } => {
                let re = Regex::new(pattern).with_context(|| format!("invalid pattern {}", pattern))?;
                let embedded = re
                    .captures(content)
                    .and_then(|cap| cap.get(1))
                    .ok_or_else(|| anyhow!("embedded list not found in page"))?;
                let items: Vec<Value> = serde_json::from_str(embedded.as_str())?;
                Ok(items
                    .iter()
                    .map(|item| {
                        RawCandidate::new(
                            json_field(item, ip_field),
                            json_field(item, port_field),
                            json_field(item, region_field),
                        )
                    })
                    .collect())
            }
        }
    }
}

/// Scalar JSON field as text; ports arrive both as numbers and strings.
fn json_field(item: &Value, field: &str) -> String {
    match item.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn extract_plain_list(content: &str) -> Vec<RawCandidate> {
    let candidates = ProxyParser::parse_string(content);
    if !candidates.is_empty() {
        return candidates;
    }

    IP_PORT_REGEX
        .captures_iter(content)
        .filter_map(|cap| {
            let host = cap.get(1)?.as_str();
            let port = cap.get(2)?.as_str();
            if !host.split('.').all(|part| part.parse::<u8>().is_ok()) {
                return None;
            }
            Some(RawCandidate::new(host, port, ""))
        })
        .collect()
}

/// A listing site: its page URLs and how to read them
#[derive(Debug, Clone)]
pub struct ProxySource {
    /// Name of the proxy source
    pub name: String,
    /// Pages to fetch, in order
    pub urls: Vec<String>,
    /// Extraction rule applied to every page
    pub rule: ExtractRule,
    /// Disabled sources are skipped by harvests
    pub enabled: bool,
}

impl ProxySource {
    pub fn new(name: &str, urls: Vec<String>, rule: ExtractRule) -> Self {
        Self {
            name: name.to_string(),
            urls,
            rule,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Listing sites the pool knows how to read out of the box
pub fn builtin_sources() -> Vec<ProxySource> {
    vec![
        ProxySource::new(
            "ip3366",
            (1..8)
                .map(|i| format!("http://www.ip3366.net/free/?stype=1&page={}", i))
                .collect(),
            ExtractRule::Regex {
                pattern: concat!(
                    r"(?s)<tr>\s*<td>(?P<ip>\d{1,3}(?:\.\d{1,3}){3})</td>\s*",
                    r"<td>(?P<port>\d{1,5})</td>\s*<td>[^<]*</td>\s*<td>[^<]*</td>\s*",
                    r"<td>(?P<region>[^<]*)</td>"
                )
                .to_string(),
            },
        )
        .disabled(),
        ProxySource::new(
            "proxylistplus",
            (1..7)
                .map(|i| format!("https://list.proxylistplus.com/Fresh-HTTP-Proxy-List-{}", i))
                .collect(),
            ExtractRule::Regex {
                pattern: concat!(
                    r"(?s)<tr[^>]*>\s*<td[^>]*>[^<]*</td>\s*",
                    r"<td>(?P<ip>\d{1,3}(?:\.\d{1,3}){3})</td>\s*<td>(?P<port>\d{1,5})</td>\s*",
                    r"<td>[^<]*</td>\s*<td>(?P<region>[^<]*)</td>"
                )
                .to_string(),
            },
        ),
        ProxySource::new(
            "kuaidaili",
            (1..11)
                .map(|i| format!("https://www.kuaidaili.com/free/inha/{}/", i))
                .collect(),
            ExtractRule::EmbeddedJson {
                pattern: r"(?s)const fpsList = (\[.*?\]);".to_string(),
                ip_field: "ip".to_string(),
                port_field: "port".to_string(),
                region_field: "location".to_string(),
            },
        ),
    ]
}

/// Result of crawling a single page
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// Name of the source the page belongs to
    pub source: String,
    /// The page that was fetched
    pub url: String,
    /// Candidates extracted from the page
    pub candidates: Vec<RawCandidate>,
    /// Error message if crawling failed
    pub error: Option<String>,
}

impl CrawlResult {
    /// Create a successful crawl result
    pub fn success(source: String, url: String, candidates: Vec<RawCandidate>) -> Self {
        Self {
            source,
            url,
            candidates,
            error: None,
        }
    }

    /// Create a failed crawl result
    pub fn failure(source: String, url: String, error: String) -> Self {
        Self {
            source,
            url,
            candidates: Vec::new(),
            error: Some(error),
        }
    }

    /// Check if the crawl was successful
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for proxy crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// Shortest pause before fetching a page
    pub min_page_delay: Duration,
    /// Longest pause before fetching a page
    pub max_page_delay: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            min_page_delay: Duration::from_secs(1),
            max_page_delay: Duration::from_secs(3),
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_page_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_page_delay = min;
        self.max_page_delay = max;
        self
    }
}

/// Proxy crawler for fetching candidates from listing sites
pub struct ProxyCrawler {
    config: CrawlerConfig,
    client: Client,
}

impl ProxyCrawler {
    /// Create a new proxy crawler with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(CrawlerConfig::default())
    }

    /// Create a new proxy crawler with custom configuration
    pub fn with_config(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Sleep for a random time inside the configured page delay range.
    pub async fn polite_delay(&self) {
        let min = self.config.min_page_delay;
        let max = self.config.max_page_delay.max(min);
        let delay = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Fetch a page body
    pub async fn fetch_page(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, random_user_agent())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    /// Fetch one page of a source and extract its candidates
    pub async fn crawl_page(&self, source: &ProxySource, url: &str) -> CrawlResult {
        let extracted = match self.fetch_page(url).await {
            Ok(content) => source.rule.extract(&content),
            Err(e) => Err(e),
        };

        match extracted {
            Ok(candidates) => {
                debug!("Found {} candidates on {}", candidates.len(), url);
                CrawlResult::success(source.name.clone(), url.to_string(), candidates)
            }
            Err(e) => {
                warn!("Error crawling {} ({}): {}", url, source.name, e);
                CrawlResult::failure(source.name.clone(), url.to_string(), e.to_string())
            }
        }
    }
}
