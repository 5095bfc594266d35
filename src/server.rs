//! HTTP exposition: `/metrics` plus liveness and readiness probes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::snapshot::MetricsSnapshot;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(snapshot: Arc<MetricsSnapshot>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .with_state(snapshot)
}

async fn metrics(State(snapshot): State<Arc<MetricsSnapshot>>) -> impl IntoResponse {
    match snapshot.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body),
        Err(e) => {
            tracing::error!(error = %e, "failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn ok() -> &'static str {
    "ok"
}

/// Serves until `cancel` fires, then lets in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    snapshot: Arc<MetricsSnapshot>,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "starting HTTP server");
    }
    axum::serve(listener, router(snapshot))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}

pub async fn bind(port: u16) -> Result<TcpListener, AppError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    Ok(TcpListener::bind(addr).await?)
}
