//! HTTP API: the orchestrator endpoint, health checks and Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use engine_lib::{
    health::HealthRegistry,
    models::ExecutionRequest,
    orchestrator::{AnalysisRunner, ErrorResponse, OrchestratorError},
    scheduler::ANALYSIS_PATH,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub runner: Arc<dyn AnalysisRunner>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, runner: Arc<dyn AnalysisRunner>) -> Self {
        Self {
            health_registry,
            runner,
        }
    }
}

fn error_response(error: &OrchestratorError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if error.is_canceled() {
        info!(kind = error.kind(), "Analysis request canceled");
    } else {
        warn!(
            kind = error.kind(),
            status = status.as_u16(),
            error = %error,
            "Analysis request failed"
        );
    }
    (status, Json(ErrorResponse::from(error))).into_response()
}

/// Run one execution request. A client that disconnects drops this future,
/// which cancels the run.
async fn analyze(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(&OrchestratorError::InvalidRequest {
                message: rejection.body_text(),
            })
        }
    };

    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();

    match state.runner.run(request, token).await {
        Ok(alerts) => (StatusCode::OK, Json(alerts)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Liveness: 200 while every component is at least degraded
async fn healthz(State(health_registry): State<HealthRegistry>) -> impl IntoResponse {
    let health = health_registry.health().await;

    let status_code = if health.status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Readiness: 503 until started, or while a component is unhealthy
async fn readyz(State(health_registry): State<HealthRegistry>) -> impl IntoResponse {
    let readiness = health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Health, readiness and metrics routes
pub fn health_router(health_registry: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health_registry)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let health_routes = health_router(state.health_registry.clone());
    Router::new()
        .route(ANALYSIS_PATH, post(analyze))
        .with_state(state)
        .merge(health_routes)
}

/// Serve `app` until `shutdown` fires
pub async fn serve(port: u16, app: Router, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
