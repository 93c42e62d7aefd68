use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{ApiError, ApiResult, AppState};
use crate::monitoring::{resolve_period, GeneratedReport, ReportFileInfo, ReportFormat};

/// Missing bounds cover the week ending at `end` (or now).
#[derive(Debug, Deserialize)]
pub struct GenerateReportRequest {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_format")]
    pub format: ReportFormat,
}

fn default_format() -> ReportFormat {
    ReportFormat::Json
}

pub async fn generate_report(
    State(state): State<AppState>,
    Json(request): Json<GenerateReportRequest>,
) -> Result<(StatusCode, Json<GeneratedReport>), ApiError> {
    let (start, end) = resolve_period(request.start, request.end, Utc::now());
    let report = state.reports.generate(start, end, request.format).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// Previously generated reports, newest first
pub async fn list_reports(State(state): State<AppState>) -> ApiResult<Vec<ReportFileInfo>> {
    Ok(Json(state.reports.list_reports().await?))
}
