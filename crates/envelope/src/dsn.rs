//! DSN parsing and ingestion endpoint matching
//!
//! A DSN (`{scheme}://{public_key}@{host}/{project_id}`) identifies the
//! ingestion endpoint a page under test reports to. The capture layer only
//! ever buffers requests whose URL matches the derived envelope endpoint
//! pattern; everything else passes through untouched.

use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EnvelopeError, EnvelopeResult};

/// `/api/<project>/envelope/` anywhere in a URL. Host-agnostic so that
/// tests can point a page at any locally-routed ingest host.
static DEFAULT_ENVELOPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/api/\d+/envelope/").expect("static envelope pattern"));

/// Parsed ingestion connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub scheme: String,
    pub public_key: String,
    pub host: String,
    pub project_id: String,
}

impl Dsn {
    /// Envelope submission URL for this DSN.
    pub fn envelope_url(&self) -> String {
        format!(
            "{}://{}/api/{}/envelope/",
            self.scheme, self.host, self.project_id
        )
    }
}

impl std::fmt::Display for Dsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}@{}/{}",
            self.scheme, self.public_key, self.host, self.project_id
        )
    }
}

impl FromStr for Dsn {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> EnvelopeResult<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| EnvelopeError::Dsn(format!("missing scheme: {}", s)))?;
        if scheme != "http" && scheme != "https" {
            return Err(EnvelopeError::Dsn(format!("unsupported scheme: {}", scheme)));
        }

        let (public_key, rest) = rest
            .split_once('@')
            .ok_or_else(|| EnvelopeError::Dsn(format!("missing public key: {}", s)))?;
        if public_key.is_empty() {
            return Err(EnvelopeError::Dsn(format!("empty public key: {}", s)));
        }

        let (host, project_id) = rest
            .rsplit_once('/')
            .ok_or_else(|| EnvelopeError::Dsn(format!("missing project id: {}", s)))?;
        if host.is_empty() || project_id.is_empty() || !project_id.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(EnvelopeError::Dsn(format!("malformed host/project: {}", s)));
        }

        Ok(Dsn {
            scheme: scheme.to_string(),
            public_key: public_key.to_string(),
            host: host.to_string(),
            project_id: project_id.to_string(),
        })
    }
}

/// Predicate deciding whether an outgoing request targets the ingestion
/// endpoint. Requests that do not match are ignored by the capture layer,
/// never buffered.
#[derive(Debug, Clone)]
pub struct IngestMatcher {
    re: Regex,
}

impl IngestMatcher {
    /// Matcher scoped to one DSN's host and project.
    pub fn for_dsn(dsn: &Dsn) -> Self {
        let pattern = format!(
            r"{}/api/{}/envelope/",
            regex::escape(&dsn.host),
            regex::escape(&dsn.project_id)
        );
        Self {
            re: Regex::new(&pattern).expect("escaped dsn pattern"),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        self.re.is_match(url)
    }

    /// The JavaScript-compatible source of the underlying pattern, for
    /// handing to in-page route interception.
    pub fn pattern(&self) -> &str {
        self.re.as_str()
    }
}

impl Default for IngestMatcher {
    fn default() -> Self {
        Self {
            re: DEFAULT_ENVELOPE_RE.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_dsn() {
        let dsn: Dsn = "https://abc123@o42.ingest.example.io/4242".parse().unwrap();
        assert_eq!(dsn.public_key, "abc123");
        assert_eq!(dsn.host, "o42.ingest.example.io");
        assert_eq!(dsn.project_id, "4242");
        assert_eq!(
            dsn.envelope_url(),
            "https://o42.ingest.example.io/api/4242/envelope/"
        );
        assert_eq!(dsn.to_string(), "https://abc123@o42.ingest.example.io/4242");
    }

    #[test]
    fn rejects_malformed_dsns() {
        for bad in [
            "o42.ingest.example.io/1",
            "ftp://k@host/1",
            "https://@host/1",
            "https://k@host/",
            "https://k@host/notanumber",
        ] {
            assert!(bad.parse::<Dsn>().is_err(), "should reject {}", bad);
        }
    }

    #[test]
    fn default_matcher_matches_any_ingest_host() {
        let matcher = IngestMatcher::default();
        assert!(matcher.matches("https://o42.ingest.example.io/api/4242/envelope/?sdk=1"));
        assert!(matcher.matches("http://127.0.0.1:9999/api/1/envelope/"));
        assert!(!matcher.matches("http://127.0.0.1:9999/index.html"));
        assert!(!matcher.matches("https://example.com/api/abc/envelope/"));
    }

    #[test]
    fn dsn_matcher_is_scoped_to_host_and_project() {
        let dsn: Dsn = "https://k@o1.ingest.example.io/7".parse().unwrap();
        let matcher = IngestMatcher::for_dsn(&dsn);
        assert!(matcher.matches("https://o1.ingest.example.io/api/7/envelope/"));
        assert!(!matcher.matches("https://o1.ingest.example.io/api/8/envelope/"));
        assert!(!matcher.matches("https://other.example.io/api/7/envelope/"));
    }
}
