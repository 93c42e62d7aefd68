use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use validator::Validate;

use super::{validated, ApiError, ApiResult, AppState};
use crate::error::HealthError;
use crate::monitoring::{RemediationLog, RemediationLogFilter, RemediationRule, RuleCondition};

/// Body of rule create and update calls. On update the path id wins.
#[derive(Debug, Deserialize, Validate)]
pub struct RuleRequest {
    #[validate(length(min = 1, max = 128, message = "Rule id must be between 1 and 128 characters"))]
    pub id: Option<String>,
    #[validate(length(min = 1, message = "Module is required"))]
    pub module: String,
    #[serde(default)]
    #[validate(length(max = 1000))]
    pub description: String,
    pub condition: RuleCondition,
    #[validate(length(min = 1, message = "At least one action is required"))]
    pub actions: Vec<String>,
    pub enabled: Option<bool>,
    pub cooldown_seconds: Option<u64>,
    #[validate(range(min = 1, message = "Trigger budget must be at least 1"))]
    pub max_triggers_per_window: Option<u32>,
    #[validate(range(min = 1, message = "Window must be at least one second"))]
    pub window_seconds: Option<u64>,
    pub continue_on_action_failure: Option<bool>,
    pub notify_on_success: Option<bool>,
    pub notify_on_failure: Option<bool>,
}

impl RuleRequest {
    fn into_rule(self, id: String) -> RemediationRule {
        let mut rule = RemediationRule::new(id, self.module, self.condition, self.actions);
        rule.description = self.description;
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(cooldown) = self.cooldown_seconds {
            rule.cooldown_seconds = cooldown;
        }
        if let Some(budget) = self.max_triggers_per_window {
            rule.max_triggers_per_window = budget;
        }
        if let Some(window) = self.window_seconds {
            rule.window_seconds = window;
        }
        if let Some(flag) = self.continue_on_action_failure {
            rule.continue_on_action_failure = flag;
        }
        if let Some(flag) = self.notify_on_success {
            rule.notify_on_success = flag;
        }
        if let Some(flag) = self.notify_on_failure {
            rule.notify_on_failure = flag;
        }
        rule
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LogQuery {
    pub module: Option<String>,
    pub rule_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 1000, message = "Limit must be between 1 and 1000"))]
    pub limit: Option<usize>,
}

pub async fn list_rules(State(state): State<AppState>) -> ApiResult<Vec<RemediationRule>> {
    Ok(Json(state.orchestrator.rules().list().await))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(request): Json<RuleRequest>,
) -> Result<(StatusCode, Json<RemediationRule>), ApiError> {
    let request = validated(request)?;
    let id = request
        .id
        .clone()
        .ok_or_else(|| ApiError(HealthError::Validation("Rule id is required".into())))?;
    let rule = state
        .orchestrator
        .rules()
        .create(request.into_rule(id), state.orchestrator.registry())
        .await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RuleRequest>,
) -> ApiResult<RemediationRule> {
    let request = validated(request)?;
    let rule = state
        .orchestrator
        .rules()
        .update(&id, request.into_rule(id.clone()), state.orchestrator.registry())
        .await?;
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RemediationRule> {
    Ok(Json(state.orchestrator.rules().delete(&id).await?))
}

/// Flip a rule between enabled and disabled
pub async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RemediationRule> {
    Ok(Json(state.orchestrator.rules().toggle(&id).await?))
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Vec<RemediationLog>> {
    let query = validated(query)?;
    let filter = RemediationLogFilter {
        module: query.module,
        rule_id: query.rule_id,
        start: query.start,
        end: query.end,
        limit: query.limit,
    };
    Ok(Json(
        state.orchestrator.store().remediation_logs(&filter).await?,
    ))
}
