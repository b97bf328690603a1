//! The terminal stage: forwards the request to the selected backend and
//! reports the observed outcome to that backend's breaker.
//!
//! Outcome mapping: upstream status >= 500 is forwarded verbatim but counts
//! as a breaker failure; any lower status (4xx included) is a success
//! because the backend answered. Transport errors become 502, the fixed
//! upstream timeout becomes 504, and both count as breaker failures. The
//! balancer completion guard taken from the context is released when this
//! stage returns, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use portcullis_core::clock::Clock;
use serde_json::json;
use tracing::warn;

use crate::backend::Backend;
use crate::breaker::CircuitBreaker;
use crate::metrics::Metrics;
use crate::pipeline::{Next, RequestContext, Stage, StageError, StageResult};
use crate::GATEWAY_TAG;

use super::insert_header;

static X_GATEWAY: HeaderName = HeaderName::from_static("x-gateway");
static X_BACKEND: HeaderName = HeaderName::from_static("x-backend");
static X_BACKEND_PORT: HeaderName = HeaderName::from_static("x-backend-port");
static X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");
static X_LB_ALGORITHM: HeaderName = HeaderName::from_static("x-lb-algorithm");
static X_CIRCUIT_STATE: HeaderName = HeaderName::from_static("x-circuit-state");

pub struct ProxyStage {
    client: reqwest::Client,
    upstream_timeout: Duration,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl ProxyStage {
    pub fn new(
        client: reqwest::Client,
        upstream_timeout: Duration,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            upstream_timeout,
            metrics,
            clock,
        }
    }

    fn apply_diagnostics(
        &self,
        headers: &mut HeaderMap,
        backend: &Backend,
        lb_algorithm: &str,
        breaker: &CircuitBreaker,
        elapsed_ms: u64,
    ) {
        insert_header(headers, X_GATEWAY.clone(), GATEWAY_TAG);
        insert_header(headers, X_BACKEND.clone(), backend.name());
        insert_header(headers, X_BACKEND_PORT.clone(), &backend.port().to_string());
        insert_header(headers, X_RESPONSE_TIME.clone(), &format!("{elapsed_ms}ms"));
        insert_header(headers, X_LB_ALGORITHM.clone(), lb_algorithm);
        insert_header(
            headers,
            X_CIRCUIT_STATE.clone(),
            &breaker.state().to_string(),
        );
    }
}

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> StageResult {
        let backend = ctx
            .backend
            .clone()
            .ok_or_else(|| StageError::new("proxy", "no backend attached to the request"))?;
        let breaker = ctx
            .breaker
            .clone()
            .ok_or_else(|| StageError::new("proxy", "no breaker attached to the request"))?;
        // Held for the duration of the upstream exchange; dropping it on any
        // exit below fires the balancer's completion hook exactly once.
        let _completion = ctx.completion.take();

        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", backend.authority(), path_and_query);

        let mut builder = self
            .client
            .request(ctx.method.clone(), &url)
            .timeout(self.upstream_timeout);

        // Copy request headers; reqwest rewrites Host from the target URL
        // and content-length follows the forwarded body.
        for (name, value) in ctx.headers.iter() {
            if name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }

        let body = ctx.body.take().unwrap_or_else(Body::empty);
        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(backend = backend.name(), ?err, "failed to read request body");
                let mut response = (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": "failed to read request body" })),
                )
                    .into_response();
                let lb_algorithm = ctx.metadata.get("load_balancer").cloned().unwrap_or_default();
                self.apply_diagnostics(response.headers_mut(), &backend, &lb_algorithm, &breaker, 0);
                return Ok(response);
            }
        };
        if !body_bytes.is_empty() {
            builder = builder.body(body_bytes);
        }

        let lb_algorithm = ctx.metadata.get("load_balancer").cloned().unwrap_or_default();
        let started = self.clock.now_millis();

        let outcome = match builder.send().await {
            Ok(upstream) => {
                let status = upstream.status();
                let upstream_headers = upstream.headers().clone();
                upstream
                    .bytes()
                    .await
                    .map(|bytes| (status, upstream_headers, bytes))
            }
            Err(err) => Err(err),
        };
        let elapsed_ms = self.clock.now_millis().saturating_sub(started);

        match outcome {
            Ok((status, upstream_headers, bytes)) => {
                if status.as_u16() >= 500 {
                    breaker.on_failure();
                } else {
                    breaker.on_success();
                }
                self.metrics.record_proxied(backend.name());

                let mut forwarded = Response::builder().status(status);
                for (name, value) in upstream_headers.iter() {
                    if name == header::CONTENT_LENGTH
                        || name == header::TRANSFER_ENCODING
                        || name == header::CONNECTION
                    {
                        continue;
                    }
                    forwarded = forwarded.header(name.clone(), value.clone());
                }
                let mut response = forwarded
                    .body(Body::from(bytes))
                    .map_err(|err| StageError::new("proxy", err.to_string()))?;

                self.apply_diagnostics(
                    response.headers_mut(),
                    &backend,
                    &lb_algorithm,
                    &breaker,
                    elapsed_ms,
                );
                Ok(response)
            }
            Err(err) if err.is_timeout() => {
                breaker.on_failure();
                warn!(backend = backend.name(), "upstream request timed out");
                let mut response = (
                    StatusCode::GATEWAY_TIMEOUT,
                    Json(json!({
                        "error": "upstream timeout",
                        "backend": backend.name(),
                    })),
                )
                    .into_response();
                self.apply_diagnostics(
                    response.headers_mut(),
                    &backend,
                    &lb_algorithm,
                    &breaker,
                    elapsed_ms,
                );
                Ok(response)
            }
            Err(err) => {
                breaker.on_failure();
                self.metrics.incr_errors();
                warn!(backend = backend.name(), ?err, "upstream request failed");
                let mut response = (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "error": "upstream unreachable",
                        "backend": backend.name(),
                    })),
                )
                    .into_response();
                self.apply_diagnostics(
                    response.headers_mut(),
                    &backend,
                    &lb_algorithm,
                    &breaker,
                    elapsed_ms,
                );
                Ok(response)
            }
        }
    }
}
