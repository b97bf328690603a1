//! The per-request middleware chain.
//!
//! A pipeline is an ordered list of named stages fixed at startup. Each
//! stage receives the request context and a `Next` continuation; calling
//! `next` delegates to the remainder of the chain, returning without it
//! short-circuits. Stage errors are converted by the driver into a 500
//! response naming the offending stage, after the logger stage has had the
//! chance to record the outcome.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::backend::SharedBackend;
use crate::balance::CompletionGuard;
use crate::breaker::CircuitBreaker;

/// Error surfaced by a stage that could not produce a response.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {message}")]
pub struct StageError {
    pub stage: &'static str,
    pub message: String,
}

impl StageError {
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

pub type StageResult = Result<Response, StageError>;

/// Per-request state threaded through the chain.
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Consumed by the proxy stage when it forwards the request.
    pub body: Option<Body>,
    pub client_addr: SocketAddr,
    pub client_key: String,
    pub received_at: u64,
    /// Filled by the selection stage.
    pub backend: Option<SharedBackend>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Releases the balancer completion hook on drop, whatever path the
    /// request takes after selection.
    pub completion: Option<CompletionGuard>,
    /// Facts recorded by stages for the logger and diagnostic headers.
    pub metadata: HashMap<&'static str, String>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Body,
        client_addr: SocketAddr,
        client_key: String,
        received_at: u64,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body: Some(body),
            client_addr,
            client_key,
            received_at,
            backend: None,
            breaker: None,
            completion: None,
            metadata: HashMap::new(),
        }
    }
}

/// One named step of the chain.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult;
}

/// Continuation over the remainder of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub fn run<'b>(self, ctx: &'b mut RequestContext) -> BoxFuture<'b, StageResult>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.stages.split_first() {
                Some((stage, rest)) => stage.handle(ctx, Next { stages: rest }).await,
                None => Err(StageError::new(
                    "pipeline",
                    "chain exhausted without a terminal stage",
                )),
            }
        })
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Drives the chain to completion, converting stage errors into a 500
    /// response that names the failing stage.
    pub async fn run(&self, ctx: &mut RequestContext) -> Response {
        let next = Next {
            stages: &self.stages,
        };
        match next.run(ctx).await {
            Ok(response) => response,
            Err(err) => {
                error!(stage = err.stage, message = %err.message, "pipeline stage failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "internal gateway error",
                        "stage": err.stage,
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx() -> RequestContext {
        RequestContext::new(
            Method::GET,
            Uri::from_static("/demo"),
            HeaderMap::new(),
            Body::empty(),
            "127.0.0.1:9999".parse().unwrap(),
            "127.0.0.1".to_string(),
            0,
        )
    }

    struct Recorder {
        label: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult {
            self.order.lock().unwrap().push(self.label);
            next.run(ctx).await
        }
    }

    struct Terminal;

    #[async_trait]
    impl Stage for Terminal {
        fn name(&self) -> &'static str {
            "terminal"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> StageResult {
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Stage for ShortCircuit {
        fn name(&self) -> &'static str {
            "short_circuit"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> StageResult {
            Ok(StatusCode::TOO_MANY_REQUESTS.into_response())
        }
    }

    struct Failing;

    #[async_trait]
    impl Stage for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> StageResult {
            Err(StageError::new("failing", "deliberate"))
        }
    }

    struct Observer {
        observed_error: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Observer {
        fn name(&self) -> &'static str {
            "observer"
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult {
            let result = next.run(ctx).await;
            if result.is_err() {
                self.observed_error.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(Recorder {
                label: "first",
                order: order.clone(),
            }),
            Arc::new(Recorder {
                label: "second",
                order: order.clone(),
            }),
            Arc::new(Terminal),
        ]);

        let response = pipeline.run(&mut test_ctx()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn a_stage_that_skips_next_short_circuits_the_chain() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(ShortCircuit),
            Arc::new(Recorder {
                label: "unreached",
                order: order.clone(),
            }),
        ]);

        let response = pipeline.run(&mut test_ctx()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stage_errors_become_500_naming_the_stage() {
        let pipeline = Pipeline::new(vec![Arc::new(Failing)]);
        let response = pipeline.run(&mut test_ctx()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["stage"], "failing");
    }

    #[tokio::test]
    async fn outer_stages_observe_inner_errors_before_the_driver() {
        let observed = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            Arc::new(Observer {
                observed_error: observed.clone(),
            }),
            Arc::new(Failing),
        ]);

        let response = pipeline.run(&mut test_ctx()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn an_exhausted_chain_is_reported_as_a_pipeline_error() {
        let pipeline = Pipeline::new(vec![]);
        let response = pipeline.run(&mut test_ctx()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
