//! HTTP load balancer
//!
//! Single-binary service that:
//! 1. Builds a backend pool from configured URLs and/or a port range
//! 2. Probes every backend's health endpoint in the background
//! 3. Forwards each request to the next healthy backend by round robin,
//!    falling back to the next one on transport failure
//! 4. Serves pool health and Prometheus metrics on a separate admin listener

mod admin;
mod balancer;
mod config;
mod error;
mod metrics;
mod monitor;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use resource_pool::Pool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::balancer::{Backend, BalancerState, Counters, forwarding_client};
use crate::config::Config;
use crate::monitor::{HealthySet, ProbeSettings, spawn_health_monitor};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the balancing router: every method and path goes to the fallback.
fn build_router(state: BalancerState, max_connections: usize) -> Router {
    Router::new()
        .fallback(balance_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting load-balancer");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let backends: Vec<Backend> = config
        .backend_urls()
        .into_iter()
        .map(Backend::new)
        .collect();

    info!(
        listen_addr = %config.balancer.listen_addr,
        admin_addr = %config.balancer.admin_addr,
        backends = backends.len(),
        "configuration loaded"
    );

    // Until the first probe cycle completes every configured backend is eligible
    let initial = HealthySet::new(backends.iter().map(|b| b.url().to_string()));
    let (healthy_tx, healthy_rx) = watch::channel(initial);
    let pool = Arc::new(Pool::new("backends", backends));

    let client = forwarding_client().context("failed to build HTTP client")?;
    let counters = Arc::new(Counters::new());

    let monitor = spawn_health_monitor(
        pool.clone(),
        client.clone(),
        ProbeSettings {
            interval: config.health.interval(),
            cooldown: config.health.cooldown(),
            timeout: config.health.timeout(),
            path: config.health.path.clone(),
        },
        healthy_tx,
    );

    let balancer_state = BalancerState {
        client,
        pool: pool.clone(),
        healthy: healthy_rx.clone(),
        timeout: config.request_timeout(),
        counters: counters.clone(),
    };
    let app = build_router(balancer_state, config.balancer.max_connections);

    let admin_app = build_admin_router(AdminState {
        pool,
        healthy: healthy_rx,
        counters,
        prometheus: prometheus_handle,
    });

    let listener = TcpListener::bind(config.balancer.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.balancer.listen_addr))?;
    let admin_listener = TcpListener::bind(config.balancer.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.balancer.admin_addr))?;

    info!(addr = %config.balancer.listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify both servers to drain, then race the drain
    // against the timeout.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut admin_shutdown = shutdown_rx.clone();
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = admin_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let mut server_shutdown = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    monitor.abort();

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }
    admin_handle.abort();

    info!("shutdown complete");
    Ok(())
}

/// Catch-all handler that balances every request across healthy backends.
async fn balance_handler(
    State(state): State<BalancerState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let method = request.method().to_string();
    let started = Instant::now();

    let response = balancer::forward(&state, request, &request_id)
        .await
        .unwrap_or_else(IntoResponse::into_response);

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
