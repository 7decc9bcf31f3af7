//! Rate limit policy engine.
//!
//! Resolves the client key, counts the request against the distributed store
//! and turns the result into a [`Decision`]. Store failures never escape: they
//! become either an in-process fallback count (development) or
//! [`Decision::ServiceUnavailable`] (production).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::fallback::FallbackTable;
use super::identity::ClientIdentityResolver;
use super::policy::{Policy, RequestInfo};
use super::store::{CounterStore, StoreError, WindowCount};
use crate::config::Environment;

/// Prefix of every counter key, shared by the store and the fallback table.
pub const KEY_PREFIX: &str = "ratelimit:";

/// Default bound on a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// Values for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window ends
    pub reset_secs: u64,
}

/// Outcome of evaluating one request against one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request. `None` when the policy skipped it.
    Allow(Option<RateLimitHeaders>),
    /// Over the limit.
    Reject {
        headers: RateLimitHeaders,
        retry_after_secs: u64,
    },
    /// The counter store is down and this environment fails closed.
    ServiceUnavailable,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    pub fn headers(&self) -> Option<RateLimitHeaders> {
        match self {
            Decision::Allow(headers) => *headers,
            Decision::Reject { headers, .. } => Some(*headers),
            Decision::ServiceUnavailable => None,
        }
    }
}

/// Where a request was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountSource {
    Store,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
struct WindowUsage {
    count: u64,
    reset_after: Duration,
    source: CountSource,
}

/// Evaluates requests against policies.
pub struct PolicyEngine {
    store: Arc<dyn CounterStore>,
    fallback: Arc<FallbackTable>,
    resolver: ClientIdentityResolver,
    environment: Environment,
    store_timeout: Duration,
    development_fallback: bool,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("resolver", &self.resolver)
            .field("environment", &self.environment)
            .field("store_timeout", &self.store_timeout)
            .field("development_fallback", &self.development_fallback)
            .finish()
    }
}

impl PolicyEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        fallback: Arc<FallbackTable>,
        resolver: ClientIdentityResolver,
        environment: Environment,
    ) -> Self {
        Self {
            store,
            fallback,
            resolver,
            environment,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            development_fallback: true,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Whether a development deployment counts in-process when the store
    /// fails. When disabled, development fails closed like production.
    pub fn with_development_fallback(mut self, enabled: bool) -> Self {
        self.development_fallback = enabled;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn fallback(&self) -> &Arc<FallbackTable> {
        &self.fallback
    }

    /// Counter key for a request under a policy.
    pub fn counter_key<R: RequestInfo + ?Sized>(&self, request: &R, policy: &Policy) -> String {
        format!("{}{}", KEY_PREFIX, policy.client_key(request, &self.resolver))
    }

    /// Count `request` against `policy` and decide whether it may proceed.
    ///
    /// Every request that is not skipped is counted exactly once, before the
    /// threshold check: the request at `limit` is allowed, the next rejected.
    pub async fn evaluate<R>(&self, request: &R, policy: &Policy) -> Decision
    where
        R: RequestInfo + Sync + ?Sized,
    {
        if policy.should_skip(request) {
            trace!(policy = policy.name(), path = %request.path(), "Skipping rate limit");
            return Decision::Allow(None);
        }

        let key = self.counter_key(request, policy);

        let usage = match self.increment_in_store(&key, policy.window()).await {
            Ok(count) => WindowUsage {
                count: count.count,
                reset_after: count.ttl,
                source: CountSource::Store,
            },
            Err(err) => match self.on_store_failure(&key, policy, &err) {
                Some(usage) => usage,
                None => return Decision::ServiceUnavailable,
            },
        };

        let limit = policy.limit();
        let headers = RateLimitHeaders {
            limit,
            remaining: limit.saturating_sub(usage.count),
            // A window that is about to end still resets in the future.
            reset_secs: ceil_secs(usage.reset_after).max(1),
        };

        trace!(
            key = %key,
            policy = policy.name(),
            count = usage.count,
            limit = limit,
            source = ?usage.source,
            "Checked rate limit"
        );

        if usage.count > limit {
            debug!(
                key = %key,
                policy = policy.name(),
                count = usage.count,
                limit = limit,
                "Rate limit exceeded"
            );
            Decision::Reject {
                headers,
                retry_after_secs: headers.reset_secs,
            }
        } else {
            Decision::Allow(Some(headers))
        }
    }

    async fn increment_in_store(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        tokio::time::timeout(self.store_timeout, self.store.increment(key, window))
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    fn on_store_failure(&self, key: &str, policy: &Policy, err: &StoreError) -> Option<WindowUsage> {
        if self.environment.is_production() || !self.development_fallback {
            error!(
                key = %key,
                policy = policy.name(),
                environment = %self.environment,
                error = %err,
                "Counter store unavailable, failing closed"
            );
            return None;
        }

        warn!(
            key = %key,
            policy = policy.name(),
            error = %err,
            "Counter store unavailable, counting in process memory"
        );

        let counted = self.fallback.increment(key, policy.window(), policy.limit());
        let now = self.fallback.now_ms();
        Some(WindowUsage {
            count: counted.count,
            reset_after: Duration::from_millis(counted.reset_at_ms.saturating_sub(now)),
            source: CountSource::Fallback,
        })
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    ms.div_ceil(1000)
}
