//! Rate limit policies.

use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::identity::ClientIdentityResolver;
use crate::error::{Result, TollgateError};

/// Longest window a policy accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// The parts of an inbound request a policy looks at.
pub trait RequestInfo {
    fn headers(&self) -> &HeaderMap;
    fn path(&self) -> &str;
}

impl<B> RequestInfo for Request<B> {
    fn headers(&self) -> &HeaderMap {
        Request::headers(self)
    }

    fn path(&self) -> &str {
        self.uri().path()
    }
}

impl RequestInfo for Parts {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn path(&self) -> &str {
        self.uri.path()
    }
}

/// How the client part of a counter key is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Resolve the client from address hints or a header fingerprint.
    #[default]
    ClientIdentity,
    /// Use a request header (such as an API key), falling back to the client
    /// identity when the header is absent or empty.
    Header { name: String },
}

/// Requests a policy does not count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipRule {
    Path(String),
    PathPrefix(String),
}

impl SkipRule {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            SkipRule::Path(p) => path == p,
            SkipRule::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// An immutable limit: `limit` requests per `window` for each client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    limit: u64,
    window: Duration,
    message: String,
    key: KeyStrategy,
    /// Namespace for the client key, so policies never share a counter
    scope: Option<String>,
    skip: Vec<SkipRule>,
}

impl Policy {
    /// Build a policy, rejecting values that could never be enforced.
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        window: Duration,
        message: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let message = message.into();

        if limit == 0 {
            return Err(TollgateError::InvalidPolicy(format!(
                "{}: limit must be greater than zero",
                name
            )));
        }
        if window.as_millis() == 0 {
            return Err(TollgateError::InvalidPolicy(format!(
                "{}: window must be at least one millisecond",
                name
            )));
        }
        if window > MAX_WINDOW {
            return Err(TollgateError::InvalidPolicy(format!(
                "{}: window must not exceed {}s",
                name,
                MAX_WINDOW.as_secs()
            )));
        }
        if message.trim().is_empty() {
            return Err(TollgateError::InvalidPolicy(format!(
                "{}: message must not be empty",
                name
            )));
        }

        Ok(Self {
            name,
            limit,
            window,
            message,
            key: KeyStrategy::default(),
            scope: None,
            skip: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    /// Prefix every client key with `scope`.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_skip(mut self, skip: Vec<SkipRule>) -> Self {
        self.skip = skip;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn skip_rules(&self) -> &[SkipRule] {
        &self.skip
    }

    /// Whether this request bypasses counting entirely.
    pub fn should_skip<R: RequestInfo + ?Sized>(&self, request: &R) -> bool {
        let path = request.path();
        self.skip.iter().any(|rule| rule.matches(path))
    }

    /// The client part of the counter key for this request.
    pub fn client_key<R: RequestInfo + ?Sized>(
        &self,
        request: &R,
        resolver: &ClientIdentityResolver,
    ) -> String {
        let client = match &self.key {
            KeyStrategy::ClientIdentity => resolver.resolve(request.headers()),
            KeyStrategy::Header { name } => request
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}:{}", name.to_ascii_lowercase(), v))
                .unwrap_or_else(|| resolver.resolve(request.headers())),
        };

        match &self.scope {
            Some(scope) => format!("{}:{}", scope, client),
            None => client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::new("test", 10, Duration::from_secs(60), "Too many requests").unwrap()
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn test_invalid_policies_rejected() {
        let window = Duration::from_secs(1);
        assert!(Policy::new("zero-limit", 0, window, "msg").is_err());
        assert!(Policy::new("zero-window", 5, Duration::ZERO, "msg").is_err());
        assert!(Policy::new("sub-ms-window", 5, Duration::from_micros(10), "msg").is_err());
        assert!(Policy::new("no-message", 5, window, "  ").is_err());
        assert!(Policy::new("huge-window", 5, Duration::from_millis(u64::MAX), "msg").is_err());
        assert!(Policy::new("max-window", 5, MAX_WINDOW, "msg").is_ok());
    }

    #[test]
    fn test_skip_rules() {
        let policy = policy().with_skip(vec![
            SkipRule::Path("/health".to_string()),
            SkipRule::PathPrefix("/static/".to_string()),
        ]);

        assert!(policy.should_skip(&request("/health")));
        assert!(policy.should_skip(&request("/static/app.js")));
        assert!(!policy.should_skip(&request("/health/deep")));
        assert!(!policy.should_skip(&request("/api/items")));
    }

    #[test]
    fn test_no_skip_rules_counts_everything() {
        assert!(!policy().should_skip(&request("/health")));
    }

    #[test]
    fn test_request_parts_match_request() {
        let policy = policy().with_skip(vec![SkipRule::Path("/health".to_string())]);
        let (parts, _body) = request("/health").into_parts();
        assert!(policy.should_skip(&parts));
    }

    #[test]
    fn test_header_key_strategy() {
        let resolver = ClientIdentityResolver::new(true);
        let policy = policy().with_key(KeyStrategy::Header {
            name: "X-Api-Key".to_string(),
        });

        let keyed = Request::builder()
            .uri("/api")
            .header("x-api-key", "abc123")
            .header("x-forwarded-for", "203.0.113.5")
            .body(())
            .unwrap();
        assert_eq!(policy.client_key(&keyed, &resolver), "x-api-key:abc123");

        let anonymous = Request::builder()
            .uri("/api")
            .header("x-forwarded-for", "203.0.113.5")
            .body(())
            .unwrap();
        assert_eq!(policy.client_key(&anonymous, &resolver), "203.0.113.5");
    }

    #[test]
    fn test_scope_prefixes_client_key() {
        let resolver = ClientIdentityResolver::new(true);
        let request = Request::builder()
            .uri("/api")
            .header("x-forwarded-for", "203.0.113.5")
            .body(())
            .unwrap();

        assert_eq!(policy().client_key(&request, &resolver), "203.0.113.5");
        assert_eq!(
            policy().with_scope("auth").client_key(&request, &resolver),
            "auth:203.0.113.5"
        );
    }

    #[test]
    fn test_key_strategy_from_yaml() {
        let strategy: KeyStrategy = serde_yaml::from_str("type: header\nname: x-api-key").unwrap();
        assert_eq!(
            strategy,
            KeyStrategy::Header {
                name: "x-api-key".to_string()
            }
        );
    }
}
