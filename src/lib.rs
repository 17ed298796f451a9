pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod router;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::proxy::{Dispatcher, ProxyState};
use crate::rate_limit::{AccelRedirectLayer, PaceLayer, RateLimitService};
use crate::router::Router;
use axum::{routing::get, Router as AxumRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the application and the limiter it owns.
///
/// Requests pass through the redirect interceptor, then the pacing stage, then the
/// dispatcher (proxy or static files). The caller shuts the limiter down once the
/// server stops.
pub async fn build_app(
    config: &AppConfig,
    metrics: Option<MetricsService>,
) -> Result<(AxumRouter, Arc<RateLimitService>)> {
    config.validate()?;

    let router = Router::new(config.routes.clone())?;
    info!("Loaded {} routes", router.patterns().len());

    let proxy_state = ProxyState::new(router, Duration::from_secs(config.server.timeout_secs))?;
    let dispatcher = Dispatcher::new(proxy_state, &config.static_files.root);

    let limiter = Arc::new(RateLimitService::from_settings(&config.rate_limit).await?);

    let stack = ServiceBuilder::new()
        .layer(AccelRedirectLayer::new(limiter.clone()))
        .layer(PaceLayer::new())
        .service(dispatcher);

    let mut app = AxumRouter::new();
    if let Some(metrics) = metrics {
        app = app.route(&config.metrics.path, get(metrics_handler).with_state(metrics));
    }

    let app = app
        .fallback_service(stack)
        .layer(TraceLayer::new_for_http());

    Ok((app, limiter))
}

/// Serve until Ctrl-C or SIGTERM, then tear the limiter down
pub async fn serve(config: AppConfig) -> Result<()> {
    let metrics = if config.metrics.enabled {
        Some(MetricsService::new()?)
    } else {
        None
    };

    let (app, limiter) = build_app(&config, metrics).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        addr = %addr,
        static_root = %config.static_files.root.display(),
        redis = config.rate_limit.redis.is_some(),
        "Server ready to accept connections"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Internal(format!("Server error: {}", e)));

    limiter.shutdown().await;
    info!("Server stopped");

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accel_ratelimit=debug,tower_http=debug".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
