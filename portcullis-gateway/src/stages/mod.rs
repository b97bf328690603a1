//! The pipeline stages wiring the gateway subsystems into the request flow:
//! logger, CORS, rate limiting, backend selection and the upstream proxy.

mod cors;
mod logger;
mod proxy;
mod rate_limit;
mod select;

pub use cors::CorsStage;
pub use logger::LoggerStage;
pub use proxy::ProxyStage;
pub use rate_limit::RateLimitStage;
pub use select::SelectStage;

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Derives the rate-limit/hashing partition key for a request: the first
/// `X-Forwarded-For` entry when the deployment trusts it, otherwise the
/// peer address.
pub fn client_key(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return forwarded.to_string();
        }
    }
    peer.ip().to_string()
}

/// Inserts a header, dropping values that do not fit the wire format
/// instead of failing the request.
pub(crate) fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(err) => warn!(header = %name, ?err, "dropping unrepresentable header value"),
    }
}
