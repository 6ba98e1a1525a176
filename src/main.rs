mod circuit_breaker;
mod config;
mod context;
mod error;
mod gateway;
mod handlers;
mod ledger;
mod middleware;
mod ratelimit;
mod registry;
mod report;
mod router;
mod upstream;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    routing::any,
};
use gateway::Gateway;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{GatewayConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let gateway = Arc::new(Gateway::from_config(cfg).await?);
    gateway.spawn_background_tasks();

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "risk gateway listening");

    axum::serve(
        listener,
        app(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("gateway server error")?;

    Ok(())
}

fn app(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(any(gateway_handler)).with_state(gateway)
}

async fn gateway_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received; draining connections");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper=warn,reqwest=warn,tower_http=warn")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
