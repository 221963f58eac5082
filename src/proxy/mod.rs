//! Proxy module: the per-endpoint building blocks of the pool
//!
//! This module provides functionality for:
//! - Modelling proxy records, candidates and validation outcomes
//! - Probing a candidate over HTTP and HTTPS and classifying its anonymity
//! - Scoring records after each check
//! - Crawling listing sites and parsing candidate lists

pub mod checker;
pub mod crawler;
pub mod geo;
pub mod models;
pub mod parser;
pub mod scoring;

pub use checker::{classify_anonymity, CheckerConfig, EchoBody, ProxyChecker, Validator};
pub use crawler::{builtin_sources, CrawlResult, CrawlerConfig, ExtractRule, ProxyCrawler, ProxySource};
pub use geo::{GeoLocation, GeoLocator};
pub use models::{
    AnonymityLevel, Candidate, Protocol, ProtocolSupport, ProxyRecord, RawCandidate, ValidationOutcome,
    UNTESTED_LATENCY,
};
pub use parser::ProxyParser;
pub use scoring::{ScoreAction, ScoringPolicy, DEFAULT_MAX_SCORE};
