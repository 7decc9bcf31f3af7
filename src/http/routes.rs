//! Router wiring each endpoint to its limiter.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use super::layer::RateLimitLayer;
use crate::ratelimit::{LimiterKind, PolicyEngine, Registry, HEALTH_PATH};

/// Shared state for the router.
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: Arc<PolicyEngine>,
    pub registry: Arc<Registry>,
    pub instance_id: Arc<str>,
}

impl AppState {
    pub fn new(engine: Arc<PolicyEngine>, registry: Arc<Registry>, instance_id: &str) -> Self {
        Self {
            engine,
            registry,
            instance_id: Arc::from(instance_id),
        }
    }

    /// Layer enforcing the registry entry for `kind`.
    pub fn limit(&self, kind: LimiterKind) -> RateLimitLayer {
        RateLimitLayer::new(self.engine.clone(), self.registry.get(kind))
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    store: &'static str,
    environment: String,
    instance: String,
}

#[derive(Debug, Serialize)]
struct AcceptedBody {
    accepted: bool,
    limiter: &'static str,
}

/// Build the application router.
///
/// Each limiter counts under its own key scope, so the routes below never
/// spend each other's budgets.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(
            "/api/status",
            get(accepted(LimiterKind::General)).layer(state.limit(LimiterKind::General)),
        )
        .route(
            "/api/auth/login",
            post(accepted(LimiterKind::Auth)).layer(state.limit(LimiterKind::Auth)),
        )
        .route(
            "/api/uploads",
            post(accepted(LimiterKind::Upload)).layer(state.limit(LimiterKind::Upload)),
        )
        .route(
            "/api/items",
            post(accepted(LimiterKind::Write)).layer(state.limit(LimiterKind::Write)),
        )
        .route(
            "/api/admin/purge",
            post(accepted(LimiterKind::Strict)).layer(state.limit(LimiterKind::Strict)),
        )
        .route(
            "/api/email/verify",
            post(accepted(LimiterKind::Email)).layer(state.limit(LimiterKind::Email)),
        )
        .with_state(state)
}

/// Placeholder endpoint reporting which limiter admitted the request.
fn accepted(
    kind: LimiterKind,
) -> impl Fn() -> std::future::Ready<Json<AcceptedBody>> + Clone + Send + Sync + 'static {
    move || {
        std::future::ready(Json(AcceptedBody {
            accepted: true,
            limiter: kind.as_str(),
        }))
    }
}

/// Reports counter store reachability. Never rate limited.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let environment = state.engine.environment();
    let store_up = match state.engine.store().health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Counter store health check failed");
            false
        }
    };

    // Production cannot serve limited routes without the store.
    let (code, status) = match (store_up, environment.is_production()) {
        (true, _) => (StatusCode::OK, "ok"),
        (false, true) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        (false, false) => (StatusCode::OK, "degraded"),
    };

    let body = HealthBody {
        status,
        store: if store_up { "up" } else { "down" },
        environment: environment.to_string(),
        instance: state.instance_id.to_string(),
    };

    (code, Json(body))
}
