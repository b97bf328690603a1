//! Backend selection: the active load balancer nominates candidates and
//! each candidate's circuit breaker gets the final word.
//!
//! Refused candidates are excluded from subsequent nominations, so
//! deterministic balancers fail over instead of re-offering the same
//! backend; the loop is bounded by the pool size. A candidate that was
//! selected but refused gets its completion hook invoked immediately to
//! keep the select/completed pairing exact.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::backend::BackendPool;
use crate::balance::CompletionGuard;
use crate::breaker::CircuitBreaker;
use crate::metrics::Metrics;
use crate::pipeline::{Next, RequestContext, Stage, StageError, StageResult};
use crate::selector::AlgorithmRegistry;

pub struct SelectStage {
    pool: Arc<BackendPool>,
    breakers: Arc<HashMap<String, Arc<CircuitBreaker>>>,
    algorithms: Arc<AlgorithmRegistry>,
    metrics: Arc<Metrics>,
}

impl SelectStage {
    pub fn new(
        pool: Arc<BackendPool>,
        breakers: Arc<HashMap<String, Arc<CircuitBreaker>>>,
        algorithms: Arc<AlgorithmRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            breakers,
            algorithms,
            metrics,
        }
    }
}

#[async_trait]
impl Stage for SelectStage {
    fn name(&self) -> &'static str {
        "select"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult {
        let balancer = self.algorithms.active().balancer.clone();
        ctx.metadata
            .insert("load_balancer", balancer.name().to_string());

        let mut refused: Vec<String> = Vec::new();
        for _ in 0..self.pool.len() {
            let Some(candidate) = balancer.select(&ctx.client_key, &refused) else {
                break;
            };

            let breaker = self
                .breakers
                .get(candidate.name())
                .ok_or_else(|| {
                    StageError::new("select", format!("no breaker for backend {}", candidate.name()))
                })?
                .clone();

            if breaker.can_request() {
                ctx.metadata.insert("backend", candidate.name().to_string());
                ctx.completion = Some(CompletionGuard::new(balancer.clone(), candidate.clone()));
                ctx.backend = Some(candidate);
                ctx.breaker = Some(breaker);
                return next.run(ctx).await;
            }

            debug!(backend = candidate.name(), "breaker refused candidate");
            balancer.completed(&candidate);
            refused.push(candidate.name().to_string());
        }

        self.metrics.incr_circuit_broken();
        let circuits: HashMap<&str, String> = self
            .breakers
            .iter()
            .map(|(name, breaker)| (name.as_str(), breaker.state().to_string()))
            .collect();

        Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "no backend available",
                "circuits": circuits,
            })),
        )
            .into_response())
    }
}
