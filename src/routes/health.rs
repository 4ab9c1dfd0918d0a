use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Duration;

use crate::app_state::AppState;
use crate::models::api::DispatchStats;

const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub dispatcher: DispatchStats,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub engine: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    pub detail: Option<String>,
}

/// GET /health: engine availability plus current dispatcher load.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let engine_check = match tokio::time::timeout(ENGINE_PROBE_TIMEOUT, state.engine.version()).await {
        Ok(Ok(version)) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            detail: Some(version),
        },
        Ok(Err(e)) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
            detail: Some(e.to_string()),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
            detail: Some("engine probe timed out".to_string()),
        },
    };

    let healthy = engine_check.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            engine: engine_check,
        },
        dispatcher: state.dispatcher.stats(),
    };

    (status_code, Json(response))
}

/// GET /api/v1/status: queue depth and in-flight count.
pub async fn dispatch_status(State(state): State<AppState>) -> Json<DispatchStats> {
    Json(state.dispatcher.stats())
}
