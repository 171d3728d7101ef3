use axum::{extract::State, Json};

use super::{error::ApiError, response::ApiResponse, AppState};
use crate::domain::{TelemetryOutcome, TelemetryUpdate};

/// POST /telemetry - apply one device telemetry sample
pub async fn post_telemetry(
    State(state): State<AppState>,
    Json(update): Json<TelemetryUpdate>,
) -> Result<Json<ApiResponse<TelemetryOutcome>>, ApiError> {
    let outcome = state.groups.lock().apply_telemetry(&update)?;
    Ok(Json(ApiResponse::success(outcome)))
}
