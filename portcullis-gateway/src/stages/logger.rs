//! Transaction logging. Runs first so that requests rejected by a later
//! stage, or failed by the driver, still get their final line.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderName;
use portcullis_core::clock::Clock;
use tracing::{error, info};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::pipeline::{Next, RequestContext, Stage, StageResult};

use super::insert_header;

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub struct LoggerStage {
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl LoggerStage {
    pub fn new(metrics: Arc<Metrics>, clock: Arc<dyn Clock>) -> Self {
        Self { metrics, clock }
    }
}

#[async_trait]
impl Stage for LoggerStage {
    fn name(&self) -> &'static str {
        "logger"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult {
        let request_id = Uuid::new_v4().to_string();
        ctx.metadata.insert("request_id", request_id.clone());
        self.metrics.incr_total();

        let started = self.clock.now_millis();
        let method = ctx.method.clone();
        let path = ctx.uri.path().to_string();
        let client = ctx.client_key.clone();

        let mut result = next.run(ctx).await;
        let elapsed_ms = self.clock.now_millis().saturating_sub(started);

        match &mut result {
            Ok(response) => {
                insert_header(response.headers_mut(), REQUEST_ID.clone(), &request_id);
                info!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    client = %client,
                    status = response.status().as_u16(),
                    backend = ctx.metadata.get("backend").map(String::as_str),
                    elapsed_ms,
                    "request completed"
                );
            }
            Err(err) => {
                // The driver still converts this into a 500 below us.
                error!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    client = %client,
                    stage = err.stage,
                    elapsed_ms,
                    "request failed in pipeline"
                );
            }
        }

        result
    }
}
