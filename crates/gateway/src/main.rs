//! Gateway service entry point.
//!
//! Market-data subscription gateway between WebSocket clients and one or more
//! upstream feed bridges.

use anyhow::Result;
use gateway::{create_router, AppState, FeedSession, Gateway, GatewayConfig, GatewaySettings, UpstreamSession};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Buffered upstream events per feed before the feed waits on the gateway.
const FEED_EVENT_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    for feed in &config.feeds {
        info!("  FEED {}: ws={} rest={}", feed.source, feed.ws_url, feed.rest_url);
    }
    info!("  CONNECT_TIMEOUT: {:?}", config.connection.connect_timeout);
    info!("  FETCH_MAX_RETRIES: {}", config.retry.max_retries);
    info!(
        "  BASKET_TIMEOUTS: init={:?} collection={:?}",
        config.baskets.init, config.baskets.collection
    );
    info!("  LEGACY_LOOKBACK_DAYS: {}", config.legacy_lookback_days);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let (mut gateway, handle) = Gateway::new(GatewaySettings::from(&config));

    let mut feeds = Vec::new();
    for feed in &config.feeds {
        let (events_tx, events_rx) = mpsc::channel(FEED_EVENT_BUFFER);
        let (session, task) = FeedSession::spawn(feed, events_tx)?;
        gateway.attach(session.clone() as Arc<dyn UpstreamSession>, events_rx);
        feeds.push((session, task));
    }

    let gateway_task = tokio::spawn(gateway.run());

    let state = Arc::new(AppState {
        gateway: handle.clone(),
        client_channel_buffer: config.client_channel_buffer,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gateway...");
    if let Err(e) = handle.shutdown().await {
        error!("Gateway already stopped: {}", e);
    }
    let _ = gateway_task.await;

    for (session, task) in feeds {
        session.shutdown().await;
        let _ = task.await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
