use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    controller: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// GET /health
///
/// Degraded when the most recent tick was skipped.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.controller.stats();
    let healthy = stats.last_error.is_none();
    let controller = ComponentHealth {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        last_success: stats.last_success,
        error: stats.last_error,
    };

    let (code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let response = HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        checks: HealthChecks { controller },
    };
    (code, Json(response))
}
