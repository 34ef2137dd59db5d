//! # Peerpoint
//!
//! Signaling relay for peer-to-peer pointer sharing.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use peerpoint_server::config::LogFormat;
use peerpoint_server::rtc::WebRtcFactory;
use peerpoint_server::{metrics, routes, AppState, RelayLimits, RelayMode, RelayState, ServerConfig};

/// Initialize structured tracing.
///
/// Set `RUST_LOG` to control log levels
/// (default: info,peerpoint_server=debug,peerpoint_core=debug,tower_http=debug).
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,peerpoint_server=debug,peerpoint_core=debug,tower_http=debug")
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init(),
    }
}

fn build_relay(config: &ServerConfig) -> anyhow::Result<RelayState> {
    let limits = RelayLimits::from(config);
    match config.mode {
        RelayMode::Hub => {
            let factory = WebRtcFactory::new(config.ice_servers.clone())
                .map_err(|e| anyhow::anyhow!("Failed to set up WebRTC: {}", e))?;
            tracing::info!(ice_servers = ?config.ice_servers, "Hub mode");
            Ok(RelayState::hub(Arc::new(factory), limits))
        }
        RelayMode::Forward => {
            tracing::info!("Forward mode");
            Ok(RelayState::forward(limits))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.log_format);

    let metrics_handle = metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to initialize Prometheus metrics: {}", e))?;
    tracing::info!("Prometheus metrics initialized");

    let relay = build_relay(&config)?;
    let registry = relay.registry().clone();

    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    let app = routes::router(AppState::new(relay)).merge(metrics_router);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Peerpoint relay listening on ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let closed = registry.shutdown().await;
    tracing::info!(closed, "Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Prometheus metrics endpoint.
#[tracing::instrument(name = "metrics", skip(handle))]
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
