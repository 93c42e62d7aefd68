pub mod checks_api;
pub mod remediation_api;
pub mod report_api;
pub mod schedule_api;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post, put},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use validator::Validate;

use crate::error::HealthError;
use crate::monitoring::{
    ApiTrafficStats, HealthScheduler, Orchestrator, PerformanceMonitor, ReportGenerator,
};

/// Application state for the web API
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Absent when periodic runs are not driven by this process.
    pub scheduler: Option<Arc<HealthScheduler>>,
    pub reports: Arc<ReportGenerator>,
    pub performance: Arc<PerformanceMonitor>,
    pub traffic: Arc<ApiTrafficStats>,
}

/// Maps domain errors onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub HealthError);

impl From<HealthError> for ApiError {
    fn from(err: HealthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HealthError::Validation(_)
            | HealthError::Configuration(_)
            | HealthError::UnknownModule { .. } => StatusCode::BAD_REQUEST,
            HealthError::RuleNotFound { .. } => StatusCode::NOT_FOUND,
            HealthError::RunInProgress => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status.is_server_error() {
            error!("Request failed: {}", self.0);
            format!("The health check system could not complete: {}", self.0)
        } else {
            self.0.to_string()
        };

        (
            status,
            Json(json!({
                "error": message,
                "system_failure": self.0.is_system_failure(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Runs `validator` rules on a request payload.
pub(crate) fn validated<T: Validate>(request: T) -> std::result::Result<T, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError(HealthError::Validation(e.to_string())))?;
    Ok(request)
}

/// Create the main API router
pub fn create_api_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/summary", get(checks_api::get_summary))
        .route("/modules", get(checks_api::list_modules))
        .route("/run", post(checks_api::run_all))
        .route("/run/:module", post(checks_api::run_module))
        .route("/history", get(checks_api::get_history))
        .route("/history/:module", get(checks_api::get_module_history))
        .route("/performance", get(checks_api::get_performance))
        .route(
            "/performance/history",
            get(checks_api::get_performance_history),
        )
        .route(
            "/schedule",
            get(schedule_api::get_schedule).put(schedule_api::update_schedule),
        )
        .route(
            "/remediation/rules",
            get(remediation_api::list_rules).post(remediation_api::create_rule),
        )
        .route(
            "/remediation/rules/:id",
            put(remediation_api::update_rule).delete(remediation_api::delete_rule),
        )
        .route(
            "/remediation/rules/:id/toggle",
            patch(remediation_api::toggle_rule),
        )
        .route("/remediation/logs", get(remediation_api::list_logs))
        .route(
            "/reports",
            get(report_api::list_reports).post(report_api::generate_report),
        );

    Router::new()
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics))
        .nest("/api/health-check", health_routes)
        .layer(middleware::from_fn_with_state(
            state.traffic.clone(),
            track_traffic,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Health check endpoint
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "health-orchestrator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.orchestrator.metrics().gather_metrics(),
    )
}

/// Feeds request latency and error counts into the performance monitor.
async fn track_traffic(
    State(traffic): State<Arc<ApiTrafficStats>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    traffic.record(started.elapsed(), response.status().is_server_error());
    response
}
