//! CORS headers on every response; preflight requests terminate here.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::CorsSettings;
use crate::pipeline::{Next, RequestContext, Stage, StageResult};

use super::insert_header;

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Authorization, Accept, Origin, X-Requested-With";

pub struct CorsStage {
    settings: CorsSettings,
}

impl CorsStage {
    pub fn new(settings: CorsSettings) -> Self {
        Self { settings }
    }

    /// The origin to echo back: `*` when configured, otherwise the request
    /// origin when it is allow-listed, otherwise the first configured entry.
    fn allow_origin(&self, request_headers: &HeaderMap) -> String {
        if self.settings.allowed_origins.iter().any(|o| o == "*") {
            return "*".to_string();
        }
        if let Some(origin) = request_headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok())
        {
            if self.settings.allowed_origins.iter().any(|o| o == origin) {
                return origin.to_string();
            }
        }
        self.settings
            .allowed_origins
            .first()
            .cloned()
            .unwrap_or_else(|| "*".to_string())
    }

    fn apply(&self, headers: &mut HeaderMap, origin: &str) {
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS);
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS);
        insert_header(
            headers,
            header::ACCESS_CONTROL_MAX_AGE,
            &self.settings.max_age.as_secs().to_string(),
        );
    }
}

#[async_trait]
impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> StageResult {
        let origin = self.allow_origin(&ctx.headers);

        if ctx.method == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            self.apply(response.headers_mut(), &origin);
            return Ok(response);
        }

        let mut response: Response = next.run(ctx).await?;
        self.apply(response.headers_mut(), &origin);
        Ok(response)
    }
}
