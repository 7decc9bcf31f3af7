//! HTTP surface: the rate limit middleware and the router it guards.

mod layer;
mod routes;
mod server;

pub use layer::{
    service_unavailable, too_many_requests, RateLimitLayer, RateLimitService, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use routes::{router, AppState};
pub use server::HttpServer;
