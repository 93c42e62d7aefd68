use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{validated, ApiResult, AppState};
use crate::monitoring::{ScheduleConfig, ScheduleUpdate, SchedulerStatistics};

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    #[serde(flatten)]
    pub config: ScheduleConfig,
    pub statistics: Option<SchedulerStatistics>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateScheduleRequest {
    pub enabled: Option<bool>,
    #[validate(range(
        min = 10,
        max = 604800,
        message = "Interval must be between 10 seconds and 7 days"
    ))]
    pub interval_seconds: Option<u64>,
}

pub async fn get_schedule(State(state): State<AppState>) -> ApiResult<ScheduleResponse> {
    let config = state.orchestrator.schedule().get().await;
    let statistics = match &state.scheduler {
        Some(scheduler) => Some(scheduler.get_statistics().await),
        None => None,
    };
    Ok(Json(ScheduleResponse { config, statistics }))
}

/// Change the automation flag or interval. The periodic job is rebuilt when
/// this process drives it.
pub async fn update_schedule(
    State(state): State<AppState>,
    Json(request): Json<UpdateScheduleRequest>,
) -> ApiResult<ScheduleResponse> {
    let request = validated(request)?;
    let update = ScheduleUpdate {
        enabled: request.enabled,
        interval_seconds: request.interval_seconds,
    };
    let (config, statistics) = match &state.scheduler {
        Some(scheduler) => {
            let config = scheduler.update_schedule(update).await?;
            (config, Some(scheduler.get_statistics().await))
        }
        None => (state.orchestrator.schedule().update(update).await?, None),
    };
    Ok(Json(ScheduleResponse { config, statistics }))
}
