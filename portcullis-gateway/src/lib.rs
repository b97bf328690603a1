pub mod backend;
pub mod balance;
pub mod breaker;
pub mod config;
pub mod control;
pub mod limit;
pub mod metrics;
pub mod pipeline;
pub mod routing;
pub mod selector;
pub mod stages;

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

use config::GatewayConfig;
use routing::{build_app, Gateway};

/// Version tag surfaced in the `x-gateway` header and the health snapshot.
pub const GATEWAY_TAG: &str = concat!("portcullis/", env!("CARGO_PKG_VERSION"));

/// Handle returned when the gateway is started programmatically.
pub struct GatewayHandle {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

impl GatewayHandle {
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
    }
}

/// Boots the gateway on the configured address (use port 0 for an
/// ephemeral one) and serves it in a background task until the handle is
/// shut down. Integration tests drive the returned address over HTTP.
pub async fn start_gateway(config: GatewayConfig) -> anyhow::Result<GatewayHandle> {
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .context("invalid gateway bind address")?;

    let gateway = Gateway::new(config)?;
    let app = build_app(gateway);

    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind gateway listener")?;
    let actual_addr = listener
        .local_addr()
        .context("failed to read socket address")?;
    info!(%actual_addr, "starting portcullis-gateway");

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.await;
        })
        .await
        .ok();
    });

    Ok(GatewayHandle {
        addr: actual_addr,
        shutdown: tx,
    })
}
