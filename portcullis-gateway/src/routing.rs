//! Gateway construction and the axum application that serves it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;

use portcullis_core::clock::{Clock, MonotonicClock};

use crate::backend::BackendPool;
use crate::balance::{
    ConsistentHash, IpHash, LeastConnections, LoadBalancer, RoundRobin, WeightedRoundRobin,
};
use crate::breaker::CircuitBreaker;
use crate::config::GatewayConfig;
use crate::control;
use crate::limit::{
    FixedWindow, LeakyBucket, RateLimiter, SlidingCounter, SlidingLog, TokenBucket,
};
use crate::metrics::Metrics;
use crate::pipeline::{Pipeline, RequestContext};
use crate::selector::AlgorithmRegistry;
use crate::stages::{
    client_key, CorsStage, LoggerStage, ProxyStage, RateLimitStage, SelectStage,
};

/// Everything the server entry point owns: the backend pool, one breaker
/// per backend, the algorithm registries, metrics and the request pipeline.
pub struct Gateway {
    pub config: GatewayConfig,
    pub pool: Arc<BackendPool>,
    pub breakers: Arc<HashMap<String, Arc<CircuitBreaker>>>,
    pub algorithms: Arc<AlgorithmRegistry>,
    pub metrics: Arc<Metrics>,
    pub pipeline: Pipeline,
    pub clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: GatewayConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(BackendPool::new(&config.backends));

        let breakers: Arc<HashMap<String, Arc<CircuitBreaker>>> = Arc::new(
            pool.all()
                .iter()
                .map(|backend| {
                    (
                        backend.name().to_string(),
                        Arc::new(CircuitBreaker::new(
                            backend.name(),
                            config.breaker.clone(),
                            clock.clone(),
                        )),
                    )
                })
                .collect(),
        );

        let window_ms = config.rate.window.as_millis() as u64;
        let limiters: Vec<Arc<dyn RateLimiter>> = vec![
            Arc::new(FixedWindow::new(
                config.rate.max_requests,
                window_ms,
                clock.clone(),
            )),
            Arc::new(SlidingLog::new(
                config.rate.max_requests,
                window_ms,
                clock.clone(),
            )),
            Arc::new(SlidingCounter::new(
                config.rate.max_requests,
                window_ms,
                clock.clone(),
            )),
            Arc::new(TokenBucket::new(
                config.bucket.capacity,
                config.bucket.rate,
                clock.clone(),
            )),
            Arc::new(LeakyBucket::new(
                config.bucket.capacity,
                config.bucket.rate,
                clock.clone(),
            )),
        ];

        let balancers: Vec<Arc<dyn LoadBalancer>> = vec![
            Arc::new(RoundRobin::new(pool.clone())),
            Arc::new(WeightedRoundRobin::new(pool.clone())),
            Arc::new(LeastConnections::new(pool.clone())),
            Arc::new(IpHash::new(pool.clone())),
            Arc::new(ConsistentHash::new(pool.clone(), config.virtual_nodes)),
        ];

        let algorithms = Arc::new(
            AlgorithmRegistry::new(
                limiters,
                balancers,
                &config.default_rate_limiter,
                &config.default_load_balancer,
            )
            .context("default algorithm is not registered")?,
        );

        let metrics = Arc::new(Metrics::new());
        let client = reqwest::Client::new();

        let pipeline = Pipeline::new(vec![
            Arc::new(LoggerStage::new(metrics.clone(), clock.clone())),
            Arc::new(CorsStage::new(config.cors.clone())),
            Arc::new(RateLimitStage::new(algorithms.clone(), metrics.clone())),
            Arc::new(SelectStage::new(
                pool.clone(),
                breakers.clone(),
                algorithms.clone(),
                metrics.clone(),
            )),
            Arc::new(ProxyStage::new(
                client,
                config.proxy.upstream_timeout,
                metrics.clone(),
                clock.clone(),
            )),
        ]);

        Ok(Arc::new(Self {
            config,
            pool,
            breakers,
            algorithms,
            metrics,
            pipeline,
            clock,
        }))
    }
}

/// Assembles the router: control routes first, every other request falls
/// through to the pipeline.
pub fn build_app(gateway: Arc<Gateway>) -> Router {
    let max_concurrency = gateway.config.proxy.max_concurrency;

    Router::new()
        .merge(control::router())
        .fallback(forward)
        .layer(ConcurrencyLimitLayer::new(max_concurrency))
        .with_state(gateway)
}

async fn forward(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let key = client_key(&parts.headers, peer, gateway.config.proxy.trust_forwarded_for);

    let mut ctx = RequestContext::new(
        parts.method,
        parts.uri,
        parts.headers,
        body,
        peer,
        key,
        gateway.clock.now_millis(),
    );
    gateway.pipeline.run(&mut ctx).await
}
