//! Validation: checks which schemes a proxy relays and how anonymous it is

use crate::proxy::crawler::random_user_agent;
use crate::proxy::models::{AnonymityLevel, ProtocolSupport, ValidationOutcome};
use async_trait::async_trait;
use log::debug;
use reqwest::{header, Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Default timeout for proxy checks in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default echo endpoint requested over the plaintext scheme
pub const DEFAULT_HTTP_ECHO_URL: &str = "http://httpbin.org/get";

/// Default echo endpoint requested over the encrypted scheme
pub const DEFAULT_HTTPS_ECHO_URL: &str = "https://httpbin.org/get";

/// Request headers that reveal a proxy sat between client and echo service
const FORWARDING_HEADERS: &[&str] = &["proxy-connection", "via", "x-forwarded-for", "forwarded"];

/// Anything that can decide whether an endpoint is a usable proxy
#[async_trait]
pub trait Validator: Send + Sync {
    /// Check `address:port`. Failures are reported through the outcome, never as errors.
    async fn validate(&self, address: &str, port: u16) -> ValidationOutcome;
}

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each scheme's round trip
    pub timeout: Duration,
    /// Echo endpoint reached over plain HTTP
    pub http_echo_url: String,
    /// Echo endpoint reached over HTTPS
    pub https_echo_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            http_echo_url: DEFAULT_HTTP_ECHO_URL.to_string(),
            https_echo_url: DEFAULT_HTTPS_ECHO_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_http_echo_url(mut self, url: String) -> Self {
        self.http_echo_url = url;
        self
    }

    pub fn with_https_echo_url(mut self, url: String) -> Self {
        self.https_echo_url = url;
        self
    }
}

/// Body returned by an httpbin-style `/get` echo endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EchoBody {
    /// Client address(es) seen by the echo service, comma separated
    pub origin: String,
    /// Request headers as received by the echo service
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EchoBody {
    /// Distinct client addresses the echo service observed.
    pub fn origins(&self) -> BTreeSet<&str> {
        self.origin
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .collect()
    }

    fn has_forwarding_header(&self) -> bool {
        self.headers.iter().any(|(name, value)| {
            FORWARDING_HEADERS.contains(&name.to_lowercase().as_str()) && !value.trim().is_empty()
        })
    }
}

/// Classify how much of the client a proxy leaks, from one echo response.
pub fn classify_anonymity(body: &EchoBody) -> AnonymityLevel {
    if body.origins().len() > 1 {
        AnonymityLevel::Transparent
    } else if body.has_forwarding_header() {
        AnonymityLevel::Anonymous
    } else {
        AnonymityLevel::High
    }
}

/// Successful round trip over one scheme
#[derive(Debug, Clone, Copy, PartialEq)]
struct SchemeCheck {
    anonymity: AnonymityLevel,
    latency_secs: f64,
}

/// Proxy checker that requests an echo service through the candidate
#[derive(Debug, Clone, Default)]
pub struct ProxyChecker {
    config: CheckerConfig,
}

impl ProxyChecker {
    /// Create a new proxy checker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new proxy checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    /// Check both schemes concurrently and fold them into one outcome.
    pub async fn check(&self, address: &str, port: u16) -> ValidationOutcome {
        let client = match self.create_client(address, port) {
            Ok(client) => client,
            Err(e) => {
                debug!("Cannot build client for {}:{}: {}", address, port, e);
                return ValidationOutcome::unusable();
            }
        };

        let (http, https) = tokio::join!(
            self.check_scheme(&client, &self.config.http_echo_url),
            self.check_scheme(&client, &self.config.https_echo_url),
        );

        let outcome = combine(http, https);
        debug!(
            "Checked {}:{} -> {} {} {:.2}s",
            address, port, outcome.protocol_support, outcome.anonymity, outcome.latency_secs
        );
        outcome
    }

    /// One round trip through the proxy; any failure counts for this scheme only.
    async fn check_scheme(&self, client: &Client, url: &str) -> Option<SchemeCheck> {
        let start = Instant::now();
        let request = async {
            let response = client
                .get(url)
                .header(header::USER_AGENT, random_user_agent())
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.config.timeout, request).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                debug!("Check of {} failed: {}", url, e);
                return None;
            }
            Err(_) => {
                debug!("Check of {} timed out", url);
                return None;
            }
        };

        if !status.is_success() {
            debug!("Check of {} returned HTTP status {}", url, status);
            return None;
        }

        let latency_secs = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;

        // Only a body from the echo service counts; a proxy answering on its own does not.
        let echo: EchoBody = match serde_json::from_str(&body) {
            Ok(echo) => echo,
            Err(e) => {
                debug!("Check of {} got a non-echo body: {}", url, e);
                return None;
            }
        };
        if echo.origins().is_empty() {
            debug!("Check of {} got an echo without origin", url);
            return None;
        }

        Some(SchemeCheck {
            anonymity: classify_anonymity(&echo),
            latency_secs,
        })
    }

    /// Create a reqwest client that relays every scheme through the proxy
    fn create_client(&self, address: &str, port: u16) -> reqwest::Result<Client> {
        let proxy = ReqwestProxy::all(format!("http://{}:{}", address, port))?;

        Client::builder()
            .proxy(proxy)
            .timeout(self.config.timeout)
            .build()
    }
}

/// When both schemes answer, the plaintext check supplies anonymity and latency.
fn combine(http: Option<SchemeCheck>, https: Option<SchemeCheck>) -> ValidationOutcome {
    let support = ProtocolSupport::from_schemes(http.is_some(), https.is_some());
    match http.or(https) {
        Some(check) => ValidationOutcome::usable(support, check.anonymity, check.latency_secs),
        None => ValidationOutcome::unusable(),
    }
}

#[async_trait]
impl Validator for ProxyChecker {
    async fn validate(&self, address: &str, port: u16) -> ValidationOutcome {
        self.check(address, port).await
    }
}
