//! Logging setup and the HTTP monitoring endpoints (`/metrics`, `/livez`, `/readyz`).

use std::sync::OnceLock;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use ensign_api::health::v1::health_check_response::ServingStatus;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level; calling this more than once is a no-op.
pub fn init_tracing(conf: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(conf.log_level.as_directive()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if conf.console_log {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(level = %conf.log_level, console = conf.console_log, "logging initialized");
    }
}

/// The process wide Prometheus recorder, installed on first use.
pub fn prometheus() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "could not install prometheus recorder");
                None
            }
        })
        .clone()
}

#[derive(Clone)]
struct Monitor {
    ready: watch::Receiver<ServingStatus>,
    metrics: Option<PrometheusHandle>,
}

pub fn router(ready: watch::Receiver<ServingStatus>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(Monitor {
            ready,
            metrics: prometheus(),
        })
}

/// Serve the monitoring endpoints until the token is cancelled.
pub async fn serve(
    listener: TcpListener,
    ready: watch::Receiver<ServingStatus>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "monitoring server started");
    axum::serve(listener, router(ready))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn metrics(State(monitor): State<Monitor>) -> impl IntoResponse {
    match monitor.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder unavailable".to_string()),
    }
}

async fn livez() -> &'static str {
    "ok"
}

async fn readyz(State(monitor): State<Monitor>) -> (StatusCode, &'static str) {
    match *monitor.ready.borrow() {
        ServingStatus::Serving => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}
