//! Proxy parser module for parsing candidates from plain-text lists

use crate::proxy::models::RawCandidate;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

/// `scheme://host:port` with an optional trailing slash
static URL_FORMAT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?|socks[45])://([^:/\s]+):(\d+)/?$").expect("Invalid URL format regex")
});

/// Proxy parser for parsing candidates from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - IP:PORT REGION...
    /// - IP PORT [REGION...] (whitespace or tab separated)
    /// - scheme://IP:PORT
    pub fn parse_line(line: &str) -> Option<RawCandidate> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(candidate) = Self::parse_url_format(line) {
            return Some(candidate);
        }

        let mut fields = line.split_whitespace();
        let first = fields.next()?;

        match first.split_once(':') {
            Some((host, port)) => {
                if port.contains(':') {
                    return None;
                }
                let region = fields.collect::<Vec<_>>().join(" ");
                Self::checked(host, port, &region)
            }
            None => {
                let port = fields.next()?;
                let region = fields.collect::<Vec<_>>().join(" ");
                Self::checked(first, port, &region)
            }
        }
    }

    /// Parse URL format proxy (e.g., http://ip:port)
    fn parse_url_format(line: &str) -> Option<RawCandidate> {
        let caps = URL_FORMAT_REGEX.captures(line)?;
        Self::checked(&caps[1], &caps[2], "")
    }

    /// Only keep lines whose port is numeric, so headers and prose are skipped.
    fn checked(host: &str, port: &str, region: &str) -> Option<RawCandidate> {
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(RawCandidate::new(host, port, region))
    }

    /// Parse candidates from a string (multiple lines)
    pub fn parse_string(content: &str) -> Vec<RawCandidate> {
        content.lines().filter_map(Self::parse_line).collect()
    }

    /// Parse candidates from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<RawCandidate>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_format() {
        let candidate = ProxyParser::parse_line("192.168.1.1:8080").unwrap();
        assert_eq!(candidate.address, "192.168.1.1");
        assert_eq!(candidate.port, "8080");
        assert!(candidate.region.is_empty());
    }

    #[test]
    fn test_parse_with_region() {
        let candidate = ProxyParser::parse_line("192.168.1.1:8080 United States").unwrap();
        assert_eq!(candidate.port, "8080");
        assert_eq!(candidate.region, "United States");

        let candidate = ProxyParser::parse_line("10.0.0.1\t3128\tDE").unwrap();
        assert_eq!(candidate.address, "10.0.0.1");
        assert_eq!(candidate.port, "3128");
        assert_eq!(candidate.region, "DE");
    }

    #[test]
    fn test_parse_url_format() {
        let candidate = ProxyParser::parse_line("http://192.168.1.1:8080").unwrap();
        assert_eq!(candidate.address, "192.168.1.1");
        assert_eq!(candidate.port, "8080");

        let candidate = ProxyParser::parse_line("https://10.1.1.1:443/").unwrap();
        assert_eq!(candidate.port, "443");
    }

    #[test]
    fn test_parse_empty_line() {
        assert!(ProxyParser::parse_line("").is_none());
        assert!(ProxyParser::parse_line("   ").is_none());
    }

    #[test]
    fn test_parse_comment_line() {
        assert!(ProxyParser::parse_line("# This is a comment").is_none());
    }

    #[test]
    fn test_parse_string() {
        let content = r#"
192.168.1.1:8080
# This is a comment
http://192.168.1.3:8080
10.0.0.1 1080 Tokyo
"#;
        let candidates = ProxyParser::parse_string(content);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[2].region, "Tokyo");
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(ProxyParser::parse_line("invalid").is_none());
        assert!(ProxyParser::parse_line("192.168.1.1").is_none());
        assert!(ProxyParser::parse_line("192.168.1.1:abc").is_none());
        assert!(ProxyParser::parse_line("192.168.1.1:8080:user:pass").is_none());
        assert!(ProxyParser::parse_line("IP Port Country").is_none());
    }
}
