//! Admission control against the active rate limiter.
//!
//! Every response passing this stage carries the `X-RateLimit-*` trio;
//! denials add `Retry-After` and end here with 429.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::limit::RateDecision;
use crate::metrics::Metrics;
use crate::pipeline::{Next, RequestContext, Stage, StageResult};
use crate::selector::AlgorithmRegistry;

use super::insert_header;

static RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RATELIMIT_ALGORITHM: HeaderName = HeaderName::from_static("x-ratelimit-algorithm");

pub struct RateLimitStage {
    algorithms: Arc<AlgorithmRegistry>,
    metrics: Arc<Metrics>,
}

impl RateLimitStage {
    pub fn new(algorithms: Arc<AlgorithmRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { algorithms, metrics }
    }
}

fn apply_decision_headers(headers: &mut HeaderMap, decision: &RateDecision, algorithm: &str) {
    insert_header(headers, RATELIMIT_LIMIT.clone(), &decision.limit.to_string());
    insert_header(
        headers,
        RATELIMIT_REMAINING.clone(),
        &decision.remaining.to_string(),
    );
    insert_header(headers, RATELIMIT_ALGORITHM.clone(), algorithm);
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult {
        let limiter = self.algorithms.active().limiter.clone();
        let algorithm = limiter.name();
        ctx.metadata.insert("rate_limiter", algorithm.to_string());

        let decision = limiter.consume(&ctx.client_key);

        if !decision.allowed {
            self.metrics.incr_rate_limited();
            ctx.metadata.insert("rate_limited", "true".to_string());

            let retry_after = decision.retry_after.unwrap_or(1);
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate limit exceeded",
                    "algorithm": algorithm,
                    "retry_after": retry_after,
                })),
            )
                .into_response();
            apply_decision_headers(response.headers_mut(), &decision, algorithm);
            insert_header(
                response.headers_mut(),
                header::RETRY_AFTER,
                &retry_after.to_string(),
            );
            return Ok(response);
        }

        let mut response = next.run(ctx).await?;
        apply_decision_headers(response.headers_mut(), &decision, algorithm);
        Ok(response)
    }
}
