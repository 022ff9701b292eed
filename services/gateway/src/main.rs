//! Audit Gateway
//!
//! Single-binary service that owns the integration gateway for the audit app:
//! 1. Loads config and the persisted service credential
//! 2. Keeps the service token warm in the background
//! 3. Exposes `/health` and `/metrics` for operators
//!
//! Application route handlers live elsewhere and call into `gateway_client`
//! through the `PlatformClient` and `JobPoller` held in `AppState`.

mod config;
mod keepalive;
mod metrics;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use gateway_auth::{CredentialStore, TokenManager, now_millis};
use gateway_client::{AuthenticatedClient, JobPoller, PlatformClient};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    tokens: TokenManager,
    platform: PlatformClient,
    /// Job poller configured from `[polling]`
    jobs: JobPoller,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state, behind a
/// concurrency limit of `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting audit-gateway");

    // Install before anything emits metrics
    let prometheus = metrics::install_recorder()?;

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

    info!(
        listen_addr = %config.server.listen_addr,
        platform = %config.platform.base_url,
        signin_url = %config.auth.signin_url,
        persisted = config.auth.credential_path.is_some(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.platform.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let store = config.auth.credential_path.clone().map(CredentialStore::new);
    let tokens = TokenManager::new(http.clone(), config.auth_config()?, store);
    match tokens.restore().await {
        Ok(true) => info!("restored persisted credential"),
        Ok(false) => info!("no persisted credential, will sign in"),
        Err(e) => warn!(error = %e, "ignoring unreadable credential record"),
    }

    let api = AuthenticatedClient::new(http, config.platform.base_url.clone(), tokens.clone());
    let platform = PlatformClient::new(api);
    let jobs = platform.poller(config.polling.clone());
    info!(
        max_attempts = jobs.config().max_attempts,
        max_consecutive_errors = jobs.config().max_consecutive_errors,
        "job poller configured"
    );

    let keepalive = keepalive::spawn_keepalive(
        tokens.clone(),
        Duration::from_secs(config.auth.keepalive_secs),
    );

    let state = AppState {
        tokens,
        platform,
        jobs,
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    keepalive.abort();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// 200 while a token outside the refresh buffer is held, 503 otherwise.
/// Never includes token values.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let platform = state.platform.api().base_url().to_string();
    let buffer = state.tokens.refresh_buffer();
    let now = now_millis();
    let polling = serde_json::json!({
        "max_attempts": state.jobs.config().max_attempts,
        "max_consecutive_errors": state.jobs.config().max_consecutive_errors,
    });

    let (status_code, body) = match state.tokens.credential() {
        Some(c) if c.is_fresh(now, buffer) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "token": "valid",
                "subject_id": c.subject_id,
                "token_valid_for_secs": c.remaining_millis(now, buffer) / 1000,
                "platform": platform,
                "polling": polling,
                "uptime_seconds": uptime,
            }),
        ),
        Some(c) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "token": "expired",
                "subject_id": c.subject_id,
                "platform": platform,
                "polling": polling,
                "uptime_seconds": uptime,
            }),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "token": "missing",
                "platform": platform,
                "polling": polling,
                "uptime_seconds": uptime,
            }),
        ),
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
