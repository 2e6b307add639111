// HTTP health and metrics endpoints for the judge worker

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use judge_common::JobStore;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn JobStore>,
}

pub fn routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /health - store reachability plus queue depth by status
pub async fn health_check(State(state): State<Arc<HealthState>>) -> Response {
    match state.store.count_by_status().await {
        Ok(counts) => {
            metrics::set_queue_depth(&counts);
            let queue: Map<String, Value> = counts
                .iter()
                .map(|(status, count)| (status.to_string(), json!(count)))
                .collect();
            (StatusCode::OK, Json(json!({ "status": "ok", "queue": queue }))).into_response()
        }
        Err(e) => {
            error!(error = %e, "Health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler() -> Response {
    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn serve(addr: SocketAddr, state: Arc<HealthState>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health server to {}", addr))?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Health server error")?;

    info!("Health server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_common::store::MemoryStore;
    use judge_common::{JobDetail, NewJob, RequestRef};

    #[tokio::test]
    async fn test_health_reports_ok_with_memory_store() {
        let store = MemoryStore::new();
        store
            .insert_job(NewJob {
                request: RequestRef::Validation { request_id: 1 },
                detail: JobDetail::default(),
            })
            .await
            .unwrap();
        let state = Arc::new(HealthState {
            store: Arc::new(store),
        });

        let response = health_check(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        metrics::init_metrics();
        let response = metrics_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let state = Arc::new(HealthState {
            store: Arc::new(MemoryStore::new()),
        });
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = tokio::spawn(serve(addr, state, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }
}
