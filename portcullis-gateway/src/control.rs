//! The `/gateway/*` control surface: health snapshot, algorithm swaps,
//! backend toggles, breaker and metrics resets. JSON in and out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::breaker::{BreakerState, BreakerStats};
use crate::metrics::MetricsSnapshot;
use crate::routing::Gateway;
use crate::GATEWAY_TAG;

#[derive(Serialize)]
struct BackendHealth {
    name: String,
    host: String,
    port: u16,
    weight: u32,
    healthy: bool,
    circuit_state: BreakerState,
    requests: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    gateway: &'static str,
    rate_limiter: &'static str,
    load_balancer: &'static str,
    pipeline: Vec<&'static str>,
    backends: Vec<BackendHealth>,
    breakers: HashMap<String, BreakerStats>,
    metrics: MetricsSnapshot,
}

pub fn router() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/gateway/health", get(health))
        .route("/gateway/rate-limiter/:name", post(set_rate_limiter))
        .route("/gateway/load-balancer/:name", post(set_load_balancer))
        .route("/gateway/backend/:name/toggle", post(toggle_backend))
        .route("/gateway/circuit/:name/reset", post(reset_circuit))
        .route("/gateway/metrics/reset", post(reset_metrics))
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let active = gateway.algorithms.active();

    let backends = gateway
        .pool
        .all()
        .iter()
        .map(|backend| {
            let circuit_state = gateway
                .breakers
                .get(backend.name())
                .map(|breaker| breaker.state())
                .unwrap_or(BreakerState::Closed);
            BackendHealth {
                name: backend.name().to_string(),
                host: backend.host().to_string(),
                port: backend.port(),
                weight: backend.weight(),
                healthy: backend.is_healthy(),
                circuit_state,
                requests: gateway.metrics.backend_count(backend.name()),
            }
        })
        .collect();

    let breakers = gateway
        .breakers
        .iter()
        .map(|(name, breaker)| (name.clone(), breaker.stats()))
        .collect();

    Json(HealthResponse {
        status: "ok",
        gateway: GATEWAY_TAG,
        rate_limiter: active.limiter.name(),
        load_balancer: active.balancer.name(),
        pipeline: gateway.pipeline.stage_names(),
        backends,
        breakers,
        metrics: gateway.metrics.snapshot(),
    })
}

async fn set_rate_limiter(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Response {
    match gateway.algorithms.set_limiter(&name) {
        Ok(limiter) => Json(json!({ "active_rate_limiter": limiter.name() })).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": err.to_string(),
                "known": gateway.algorithms.limiter_names(),
            })),
        )
            .into_response(),
    }
}

async fn set_load_balancer(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Response {
    match gateway.algorithms.set_balancer(&name) {
        Ok(balancer) => Json(json!({ "active_load_balancer": balancer.name() })).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": err.to_string(),
                "known": gateway.algorithms.balancer_names(),
            })),
        )
            .into_response(),
    }
}

async fn toggle_backend(State(gateway): State<Arc<Gateway>>, Path(name): Path<String>) -> Response {
    let Some(backend) = gateway.pool.get(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown backend: {name}") })),
        )
            .into_response();
    };

    let healthy = !backend.is_healthy();
    backend.set_healthy(healthy);
    gateway.algorithms.rebuild_balancers();
    info!(backend = %name, healthy, "backend toggled");

    Json(json!({ "backend": name, "healthy": healthy })).into_response()
}

async fn reset_circuit(State(gateway): State<Arc<Gateway>>, Path(name): Path<String>) -> Response {
    let Some(breaker) = gateway.breakers.get(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown backend: {name}") })),
        )
            .into_response();
    };

    breaker.reset();
    info!(backend = %name, "circuit breaker reset");
    Json(json!({ "backend": name, "state": breaker.state() })).into_response()
}

async fn reset_metrics(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    gateway.metrics.reset();
    Json(json!({ "status": "reset" }))
}
