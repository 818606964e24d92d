//! Process entry point: load configuration, build the dependency graph,
//! serve the HTTP surface, and shut down gracefully (spec.md §5, §9).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tollgate::api::{build_router, AppState};
use tollgate::Config;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.logging.level, &config.logging.format);

    let state = Arc::new(AppState::new(config.clone()).await?);
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tollgate listening");

    let shutdown_grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("no longer accepting connections, draining quota consumer");
    tokio::time::timeout(shutdown_grace, state.shutdown_quota_consumer())
        .await
        .unwrap_or_else(|_| tracing::warn!("quota consumer drain exceeded grace period"));
    state.db_pool.close().await;
    tracing::info!("shutdown complete");

    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Resolves once SIGINT or (on unix) SIGTERM is received, letting
/// `axum::serve` stop accepting new connections and wait for in-flight
/// requests before the caller proceeds to drain the quota consumer
/// (spec.md §5 steps 1-2).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
