//! Tower middleware that applies one policy to a route.

use axum::extract::Request;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::ratelimit::{Decision, Policy, PolicyEngine, RateLimitHeaders};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const RATE_LIMITED_ERROR: &str = "Rate limit exceeded";
const UNAVAILABLE_ERROR: &str = "Service unavailable";
const UNAVAILABLE_MESSAGE: &str =
    "Rate limiting is temporarily unavailable. Please try again later.";

/// Body of a 429 response.
#[derive(Debug, Serialize)]
struct RateLimitedBody<'a> {
    error: &'static str,
    message: &'a str,
    #[serde(rename = "retryAfter")]
    retry_after: u64,
}

/// Body of a 503 response.
#[derive(Debug, Serialize)]
struct UnavailableBody {
    error: &'static str,
    message: &'static str,
}

/// Layer that counts every request to the wrapped service against `policy`.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    engine: Arc<PolicyEngine>,
    policy: Arc<Policy>,
}

impl RateLimitLayer {
    pub fn new(engine: Arc<PolicyEngine>, policy: Arc<Policy>) -> Self {
        Self { engine, policy }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            engine: self.engine.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    engine: Arc<PolicyEngine>,
    policy: Arc<Policy>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let engine = self.engine.clone();
        let policy = self.policy.clone();
        // The clone is not ready; keep the service that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let span = info_span!(
            "rate_limit",
            policy = policy.name(),
            method = %request.method(),
            path = %request.uri().path(),
        );

        Box::pin(
            async move {
                let (parts, body) = request.into_parts();

                match engine.evaluate(&parts, &policy).await {
                    Decision::Allow(headers) => {
                        let mut response = inner.call(Request::from_parts(parts, body)).await?;
                        if let Some(headers) = headers {
                            insert_rate_limit_headers(response.headers_mut(), &headers);
                        }
                        Ok(response)
                    }
                    Decision::Reject {
                        headers,
                        retry_after_secs,
                    } => Ok(too_many_requests(&policy, &headers, retry_after_secs)),
                    Decision::ServiceUnavailable => Ok(service_unavailable()),
                }
            }
            .instrument(span),
        )
    }
}

fn insert_rate_limit_headers(map: &mut HeaderMap, headers: &RateLimitHeaders) {
    map.insert(X_RATELIMIT_LIMIT, HeaderValue::from(headers.limit));
    map.insert(X_RATELIMIT_REMAINING, HeaderValue::from(headers.remaining));
    map.insert(X_RATELIMIT_RESET, HeaderValue::from(headers.reset_secs));
}

/// 429 with rate limit headers, `Retry-After` and a JSON explanation.
pub fn too_many_requests(policy: &Policy, headers: &RateLimitHeaders, retry_after_secs: u64) -> Response {
    let body = RateLimitedBody {
        error: RATE_LIMITED_ERROR,
        message: policy.message(),
        retry_after: retry_after_secs,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let map = response.headers_mut();
    insert_rate_limit_headers(map, headers);
    map.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

/// 503 returned when the limiter itself is down. Carries no rate limit headers.
pub fn service_unavailable() -> Response {
    let body = UnavailableBody {
        error: UNAVAILABLE_ERROR,
        message: UNAVAILABLE_MESSAGE,
    };
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_too_many_requests_response() {
        let policy = Policy::new("auth", 5, Duration::from_secs(60), "Too many login attempts").unwrap();
        let headers = RateLimitHeaders {
            limit: 5,
            remaining: 0,
            reset_secs: 42,
        };

        let response = too_many_requests(&policy, &headers, 42);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "42");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "42");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "error": "Rate limit exceeded",
                "message": "Too many login attempts",
                "retryAfter": 42
            })
        );
    }

    #[tokio::test]
    async fn test_service_unavailable_response() {
        let response = service_unavailable();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        assert!(response.headers().get(RETRY_AFTER).is_none());

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Service unavailable");
        assert!(body.get("retryAfter").is_none());
    }
}
