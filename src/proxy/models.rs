//! Proxy data models

use crate::error::{PoolError, PoolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Latency recorded for an endpoint that is untested or did not answer.
pub const UNTESTED_LATENCY: f64 = -1.0;

/// Error returned when parsing one of the model enums from text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseKindError {
    kind: &'static str,
    value: String,
}

impl ParseKindError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Scheme a consumer wants to relay through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(ParseKindError::new("protocol", s)),
        }
    }
}

/// Which schemes a proxy was observed to relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolSupport {
    HttpOnly,
    HttpsOnly,
    Both,
    /// Failed validation. Never persisted.
    None,
}

impl ProtocolSupport {
    /// Combine the results of the plaintext and encrypted checks.
    pub fn from_schemes(http: bool, https: bool) -> Self {
        match (http, https) {
            (true, true) => ProtocolSupport::Both,
            (true, false) => ProtocolSupport::HttpOnly,
            (false, true) => ProtocolSupport::HttpsOnly,
            (false, false) => ProtocolSupport::None,
        }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self, ProtocolSupport::None)
    }

    /// Whether a proxy with this support satisfies a request for `wanted`.
    ///
    /// A request without a protocol requires both schemes.
    pub fn satisfies(&self, wanted: Option<Protocol>) -> bool {
        Self::accepted_for(wanted).contains(self)
    }

    /// The support values that satisfy a request for `wanted`.
    pub fn accepted_for(wanted: Option<Protocol>) -> &'static [ProtocolSupport] {
        match wanted {
            None => &[ProtocolSupport::Both],
            Some(Protocol::Http) => &[ProtocolSupport::HttpOnly, ProtocolSupport::Both],
            Some(Protocol::Https) => &[ProtocolSupport::HttpsOnly, ProtocolSupport::Both],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolSupport::HttpOnly => "http",
            ProtocolSupport::HttpsOnly => "https",
            ProtocolSupport::Both => "both",
            ProtocolSupport::None => "none",
        }
    }
}

impl fmt::Display for ProtocolSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolSupport {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProtocolSupport::HttpOnly),
            "https" => Ok(ProtocolSupport::HttpsOnly),
            "both" => Ok(ProtocolSupport::Both),
            "none" => Ok(ProtocolSupport::None),
            _ => Err(ParseKindError::new("protocol support", s)),
        }
    }
}

/// How much a proxy reveals about the original client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    #[default]
    High,
    Anonymous,
    Transparent,
    Unknown,
}

impl AnonymityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityLevel::High => "high",
            AnonymityLevel::Anonymous => "anonymous",
            AnonymityLevel::Transparent => "transparent",
            AnonymityLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AnonymityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnonymityLevel {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" | "elite" => Ok(AnonymityLevel::High),
            "anonymous" => Ok(AnonymityLevel::Anonymous),
            "transparent" => Ok(AnonymityLevel::Transparent),
            "unknown" => Ok(AnonymityLevel::Unknown),
            _ => Err(ParseKindError::new("anonymity level", s)),
        }
    }
}

/// Result of probing one endpoint over both schemes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub protocol_support: ProtocolSupport,
    pub anonymity: AnonymityLevel,
    pub latency_secs: f64,
}

impl ValidationOutcome {
    pub fn usable(protocol_support: ProtocolSupport, anonymity: AnonymityLevel, latency_secs: f64) -> Self {
        Self {
            protocol_support,
            anonymity,
            latency_secs,
        }
    }

    /// Outcome for an endpoint that answered on neither scheme.
    pub fn unusable() -> Self {
        Self {
            protocol_support: ProtocolSupport::None,
            anonymity: AnonymityLevel::Unknown,
            latency_secs: UNTESTED_LATENCY,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.protocol_support.is_usable()
    }
}

/// Unvalidated endpoint exactly as a source delivered it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawCandidate {
    pub address: String,
    pub port: String,
    pub region: String,
}

impl RawCandidate {
    pub fn new(address: impl Into<String>, port: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
            region: region.into(),
        }
    }

    /// Check the scraped fields and turn them into a typed candidate.
    pub fn parse(&self) -> PoolResult<Candidate> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(PoolError::MalformedCandidate("missing address".to_string()));
        }
        if address.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(PoolError::MalformedCandidate(format!(
                "invalid address: {}",
                address
            )));
        }

        let port = self.port.trim();
        if port.is_empty() {
            return Err(PoolError::MalformedCandidate(format!(
                "missing port for {}",
                address
            )));
        }
        let port: u16 = match port.parse() {
            Ok(0) | Err(_) => {
                return Err(PoolError::MalformedCandidate(format!(
                    "invalid port for {}: {}",
                    address, port
                )))
            }
            Ok(port) => port,
        };

        let region = self.region.trim();
        Ok(Candidate {
            address: address.to_string(),
            port,
            region: (!region.is_empty()).then(|| region.to_string()),
        })
    }
}

/// Candidate whose address and port are well formed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub address: String,
    pub port: u16,
    pub region: Option<String>,
}

impl Candidate {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            region: None,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// One validated proxy in the pool, keyed by address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub address: String,
    pub port: u16,
    pub protocol_support: ProtocolSupport,
    pub anonymity: AnonymityLevel,
    pub latency_secs: f64,
    pub region: Option<String>,
    pub score: u32,
    pub disabled_domains: BTreeSet<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    /// Build the record admitted for a candidate that passed validation.
    pub fn admitted(candidate: Candidate, outcome: &ValidationOutcome, score: u32) -> Self {
        Self {
            address: candidate.address,
            port: candidate.port,
            protocol_support: outcome.protocol_support,
            anonymity: outcome.anonymity,
            latency_secs: outcome.latency_secs,
            region: candidate.region,
            score,
            disabled_domains: BTreeSet::new(),
            checked_at: Some(Utc::now()),
        }
    }

    /// Get the proxy string in IP:PORT format
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Proxy URL for the requested scheme, or the bare endpoint without one.
    pub fn url(&self, protocol: Option<Protocol>) -> String {
        match protocol {
            Some(protocol) => format!("{}://{}:{}", protocol, self.address, self.port),
            None => self.endpoint(),
        }
    }

    pub fn is_disabled_for(&self, domain: &str) -> bool {
        self.disabled_domains.contains(domain)
    }

    /// Check the invariants every stored record must hold.
    pub fn ensure_storable(&self) -> PoolResult<()> {
        if !self.protocol_support.is_usable() {
            return Err(PoolError::InvalidRecord(format!(
                "{} has no usable protocol",
                self.address
            )));
        }
        if self.score == 0 {
            return Err(PoolError::InvalidRecord(format!(
                "{} has a score of zero",
                self.address
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} {} {:.2}s score={}]",
            self.endpoint(),
            self.protocol_support,
            self.anonymity,
            self.latency_secs,
            self.score
        )
    }
}

#[cfg(test)]
pub(crate) fn sample_record(address: &str, score: u32, latency_secs: f64) -> ProxyRecord {
    ProxyRecord {
        address: address.to_string(),
        port: 8080,
        protocol_support: ProtocolSupport::Both,
        anonymity: AnonymityLevel::High,
        latency_secs,
        region: None,
        score,
        disabled_domains: BTreeSet::new(),
        checked_at: None,
    }
}
