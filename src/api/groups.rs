use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use tracing::info;

use super::{error::ApiError, response::ApiResponse, AppState};
use crate::controller::strategies::{ControlCommand, OperatorCommand};
use crate::domain::StrategyKind;
use crate::groups::GroupSummary;

#[derive(Debug, Serialize)]
pub struct StrategyAssigned {
    pub group: String,
    pub strategy: Option<StrategyKind>,
}

/// GET /groups - per-group consumption and assigned strategy
pub async fn list_groups(State(state): State<AppState>) -> Json<ApiResponse<Vec<GroupSummary>>> {
    let summaries = state.groups.lock().consumption_by_group();
    Json(ApiResponse::success(summaries))
}

/// PUT /groups/:name/strategy
pub async fn assign_strategy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(command): Json<OperatorCommand>,
) -> Result<Json<ApiResponse<StrategyAssigned>>, ApiError> {
    let kind = state
        .groups
        .lock()
        .assign_operator_command(&name, &command)?;
    Ok(Json(ApiResponse::success(StrategyAssigned {
        group: name,
        strategy: Some(kind),
    })))
}

/// DELETE /groups/:name/strategy
pub async fn unassign_strategy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<StrategyAssigned>>, ApiError> {
    let previous = state.groups.lock().unassign_strategy(&name)?;
    info!(group = %name, had_strategy = previous.is_some(), "strategy unassigned");
    Ok(Json(ApiResponse::success(StrategyAssigned {
        group: name,
        strategy: None,
    })))
}

/// PUT /site/strategy - one command for every device, overriding group strategies
pub async fn set_site_strategy(
    State(state): State<AppState>,
    Json(command): Json<OperatorCommand>,
) -> Result<Json<ApiResponse<ControlCommand>>, ApiError> {
    let command = ControlCommand::from_operator(&command)?;
    state.groups.lock().set_site_command(Some(command));
    Ok(Json(ApiResponse::success(command)))
}

/// DELETE /site/strategy
pub async fn clear_site_strategy(State(state): State<AppState>) -> Json<ApiResponse<bool>> {
    let mut manager = state.groups.lock();
    let was_set = manager.site_command().is_some();
    manager.set_site_command(None);
    Json(ApiResponse::success(was_set))
}
