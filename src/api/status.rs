use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{error::ApiError, response::ApiResponse, AppState};
use crate::controller::strategies::ControlCommand;
use crate::controller::TickStats;
use crate::hardware::SocReading;
use crate::optimizer::{OptimizationResult, SolveStatus, TierAllocation};

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub reading: Option<SocReading>,
    pub solve_status: Option<SolveStatus>,
    pub allocation: Option<TierAllocation>,
    pub site_command: Option<ControlCommand>,
    pub groups: usize,
    pub devices: usize,
    pub controller: TickStats,
    pub system: SystemInfo,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct AllocationView {
    pub allocation: TierAllocation,
    /// Solve behind the allocation; absent only before the first tick finished solving
    pub result: Option<OptimizationResult>,
}

/// GET /status - controller overview: last SoC reading, allocation and tick counters
pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<SystemStatus>> {
    let (site_command, groups, devices) = {
        let manager = state.groups.lock();
        (
            manager.site_command(),
            manager.groups().len(),
            manager.merged().len(),
        )
    };
    let status = SystemStatus {
        reading: state.controller.last_reading(),
        solve_status: state.controller.last_result().map(|r| r.status),
        allocation: state.controller.last_allocation(),
        site_command,
        groups,
        devices,
        controller: state.controller.stats(),
        system: SystemInfo {
            started_at: state.started_at,
            uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    Json(ApiResponse::success(status))
}

/// GET /allocation - the allocation applied on the last tick with its planned trace
pub async fn get_allocation(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<AllocationView>>, ApiError> {
    let allocation = state
        .controller
        .last_allocation()
        .ok_or_else(|| ApiError::NotFound("no allocation computed yet".to_string()))?;
    Ok(Json(ApiResponse::success(AllocationView {
        allocation,
        result: state.controller.last_result(),
    })))
}
