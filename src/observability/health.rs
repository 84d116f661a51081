//! Health Check & Metrics HTTP Server
//! Provides /health, /health/live, /health/ready, /metrics, /metrics/endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use super::metrics::encode_metrics;
use crate::pipeline::RequestPipeline;
use crate::resilience::CircuitState;

#[derive(Clone)]
pub struct HealthState {
    pub pipeline: Arc<RequestPipeline>,
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    exchange: String,
    checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    circuit_breaker: ComponentHealth,
    rate_limiter: ComponentHealth,
    connection: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ComponentHealth {
    fn healthy(detail: Option<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            detail,
        }
    }

    fn degraded(detail: String) -> Self {
        Self {
            status: "degraded".to_string(),
            detail: Some(detail),
        }
    }

    fn unhealthy(detail: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            detail: Some(detail),
        }
    }
}

static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

pub fn router(state: HealthState) -> Router {
    START_TIME.get_or_init(std::time::Instant::now);

    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/metrics/endpoints", get(endpoint_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the health check and metrics HTTP server
#[instrument(skip(state))]
pub async fn start_health_server(port: u16, state: HealthState) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Health/metrics server started");

    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument(skip(state))]
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let pipeline = &state.pipeline;

    let breaker_state = pipeline.circuit_breaker().state();
    let breaker_health = match breaker_state {
        CircuitState::Closed => ComponentHealth::healthy(None),
        CircuitState::HalfOpen => ComponentHealth::degraded("probing venue recovery".to_string()),
        CircuitState::Open => ComponentHealth::unhealthy("circuit open".to_string()),
    };

    let limiter_health = match pipeline.rate_limiter() {
        Some(limiter) => ComponentHealth::healthy(Some(format!(
            "{:.0}/{} tokens, {} pending",
            limiter.available_tokens(),
            limiter.config().max_tokens,
            limiter.pending()
        ))),
        None => ComponentHealth::healthy(Some("unlimited".to_string())),
    };

    let connection_health = if pipeline.is_connected() {
        ComponentHealth::healthy(Some(format!("{} in flight", pipeline.in_flight())))
    } else {
        ComponentHealth::unhealthy("disconnected".to_string())
    };

    let overall_healthy = breaker_state != CircuitState::Open && pipeline.is_connected();
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    let response = HealthResponse {
        status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        exchange: pipeline.config().exchange.clone(),
        checks: HealthChecks {
            circuit_breaker: breaker_health,
            rate_limiter: limiter_health,
            connection: connection_health,
        },
    };

    let status_code = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

#[instrument(skip(state))]
async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "reason": "initializing" })),
        );
    }

    if state.pipeline.is_connected() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "reason": "disconnected" })),
        )
    }
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}

async fn endpoint_metrics(State(state): State<HealthState>) -> impl IntoResponse {
    Json(state.pipeline.metrics_snapshot())
}
