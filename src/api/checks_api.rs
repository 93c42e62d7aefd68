use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{validated, ApiError, ApiResult, AppState};
use crate::error::HealthError;
use crate::monitoring::{HealthSummary, ModuleCheckResult, PerformanceSample, RunSummary};

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module: String,
    pub has_results: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct HistoryQuery {
    #[validate(range(min = 1, max = 1000, message = "Limit must be between 1 and 1000"))]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RangeQuery {
    /// Defaults to the last 24 hours.
    pub(crate) fn resolve(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self.start.unwrap_or(end - Duration::hours(24));
        if start > end {
            return Err(ApiError(HealthError::Validation(
                "start must not be after end".into(),
            )));
        }
        Ok((start, end))
    }
}

/// Overall status plus each module's latest result
pub async fn get_summary(State(state): State<AppState>) -> ApiResult<HealthSummary> {
    Ok(Json(state.orchestrator.summary().await?))
}

pub async fn list_modules(State(state): State<AppState>) -> ApiResult<Vec<ModuleInfo>> {
    let store = state.orchestrator.store();
    let mut modules = Vec::new();
    for module in state.orchestrator.registry().list_modules() {
        let has_results = store.latest(&module).await?.is_some();
        modules.push(ModuleInfo {
            module,
            has_results,
        });
    }
    Ok(Json(modules))
}

/// Run every registered probe now
pub async fn run_all(State(state): State<AppState>) -> ApiResult<RunSummary> {
    Ok(Json(state.orchestrator.run_manual(None).await?))
}

pub async fn run_module(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> ApiResult<RunSummary> {
    Ok(Json(state.orchestrator.run_manual(Some(&module)).await?))
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<ModuleCheckResult>> {
    let query = validated(query)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.orchestrator.history(None, limit).await?))
}

pub async fn get_module_history(
    State(state): State<AppState>,
    Path(module): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<ModuleCheckResult>> {
    let query = validated(query)?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.orchestrator.history(Some(&module), limit).await?))
}

/// Live sample; not persisted
pub async fn get_performance(State(state): State<AppState>) -> ApiResult<PerformanceSample> {
    Ok(Json(state.performance.collect().await?))
}

pub async fn get_performance_history(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Vec<PerformanceSample>> {
    let (start, end) = range.resolve()?;
    Ok(Json(state.performance.history(start, end).await?))
}
