//! Rule-driven remediation with cooldown and failure-budget safeguards.

use super::probes::{panic_message, Probe, ProbeRegistry, ProbeRunner};
use super::scoring::MAX_SCORE;
use super::state_file;
use super::store::ResultStore;
use super::{HealthStatus, ModuleCheckResult};
use crate::error::{HealthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const BUDGET_EXHAUSTED: &str = "budget-exhausted";

/// Upper bound for cooldown and budget windows (one year).
const MAX_RULE_SECONDS: u64 = 365 * 24 * 3600;

fn default_true() -> bool {
    true
}

fn default_window_seconds() -> u64 {
    3600
}

fn default_max_triggers() -> u32 {
    3
}

/// Predicate over a module's latest result and, for some variants, its
/// recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    ScoreBelow { threshold: u8 },
    StatusAtLeast { status: HealthStatus },
    ConsecutiveStatus { status: HealthStatus, runs: usize },
    CheckFailed { check: String },
    ErrorContains { pattern: String },
    WarningContains { pattern: String },
    All { conditions: Vec<RuleCondition> },
    Any { conditions: Vec<RuleCondition> },
}

impl RuleCondition {
    /// How many stored results (newest first) evaluation needs.
    pub fn history_depth(&self) -> usize {
        match self {
            RuleCondition::ConsecutiveStatus { runs, .. } => *runs,
            RuleCondition::All { conditions } | RuleCondition::Any { conditions } => conditions
                .iter()
                .map(RuleCondition::history_depth)
                .max()
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// `history` is newest first and already contains `latest`.
    pub fn evaluate(&self, latest: &ModuleCheckResult, history: &[ModuleCheckResult]) -> bool {
        match self {
            RuleCondition::ScoreBelow { threshold } => latest.score < *threshold,
            RuleCondition::StatusAtLeast { status } => latest.status.is_at_least(*status),
            RuleCondition::ConsecutiveStatus { status, runs } => {
                history.len() >= *runs
                    && history
                        .iter()
                        .take(*runs)
                        .all(|r| r.status.is_at_least(*status))
            }
            RuleCondition::CheckFailed { check } => latest.failed_check(check),
            RuleCondition::ErrorContains { pattern } => contains_ignore_case(&latest.errors, pattern),
            RuleCondition::WarningContains { pattern } => {
                contains_ignore_case(&latest.warnings, pattern)
            }
            RuleCondition::All { conditions } => {
                conditions.iter().all(|c| c.evaluate(latest, history))
            }
            RuleCondition::Any { conditions } => {
                conditions.iter().any(|c| c.evaluate(latest, history))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RuleCondition::ScoreBelow { threshold } if *threshold > MAX_SCORE => Err(
                HealthError::Validation(format!("score threshold {threshold} exceeds {MAX_SCORE}")),
            ),
            RuleCondition::ConsecutiveStatus { runs: 0, .. } => Err(HealthError::Validation(
                "consecutive_status requires at least one run".into(),
            )),
            RuleCondition::CheckFailed { check: text }
            | RuleCondition::ErrorContains { pattern: text }
            | RuleCondition::WarningContains { pattern: text }
                if text.trim().is_empty() =>
            {
                Err(HealthError::Validation("condition text must not be empty".into()))
            }
            RuleCondition::All { conditions } | RuleCondition::Any { conditions } => {
                if conditions.is_empty() {
                    return Err(HealthError::Validation(
                        "combined condition needs at least one member".into(),
                    ));
                }
                conditions.iter().try_for_each(RuleCondition::validate)
            }
            _ => Ok(()),
        }
    }
}

fn contains_ignore_case(haystack: &[String], pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    haystack.iter().any(|s| s.to_lowercase().contains(&pattern))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRule {
    pub id: String,
    pub module: String,
    #[serde(default)]
    pub description: String,
    pub condition: RuleCondition,
    pub actions: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default = "default_max_triggers")]
    pub max_triggers_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default)]
    pub continue_on_action_failure: bool,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl RemediationRule {
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        condition: RuleCondition,
        actions: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            module: module.into(),
            description: String::new(),
            condition,
            actions,
            enabled: true,
            cooldown_seconds: 0,
            max_triggers_per_window: default_max_triggers(),
            window_seconds: default_window_seconds(),
            continue_on_action_failure: false,
            notify_on_success: false,
            notify_on_failure: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks the rule can be accepted from an operator. Module existence is
    /// only checked here; a rule outliving its probe simply never fires.
    pub fn validate(&self, registry: &ProbeRegistry) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HealthError::Validation("rule id must not be empty".into()));
        }
        if !registry.contains(&self.module) {
            return Err(HealthError::UnknownModule {
                module: self.module.clone(),
            });
        }
        if self.actions.is_empty() || self.actions.iter().any(|a| a.trim().is_empty()) {
            return Err(HealthError::Validation(
                "a rule needs at least one non-empty action".into(),
            ));
        }
        if self.max_triggers_per_window == 0 {
            return Err(HealthError::Validation(
                "max_triggers_per_window must be at least 1".into(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(HealthError::Validation("window_seconds must be positive".into()));
        }
        if self.window_seconds > MAX_RULE_SECONDS || self.cooldown_seconds > MAX_RULE_SECONDS {
            return Err(HealthError::Validation(format!(
                "cooldown and window must not exceed {MAX_RULE_SECONDS} seconds"
            )));
        }
        self.condition.validate()
    }

    fn cooldown(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.cooldown_seconds.min(MAX_RULE_SECONDS) as i64)
    }

    fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.window_seconds.min(MAX_RULE_SECONDS) as i64)
    }

    /// How far back cooldown and budget accounting read remediation logs.
    pub fn accounting_window(&self) -> ChronoDuration {
        self.cooldown().max(self.window())
    }
}

/// One remediation attempt, or a budget-exhausted skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationLog {
    pub id: Uuid,
    pub rule_id: String,
    pub module: String,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub skip_reason: Option<String>,
    pub actions_executed: Vec<String>,
    pub error: Option<String>,
    pub health_score_before: u8,
    pub health_score_after: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Performs remediation actions. Supplied by the host application.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &str, module: &str) -> anyhow::Result<()>;
}

/// Operator-managed rule set.
///
/// Readers take an `Arc` snapshot; writers build a new vector and swap it
/// in, so an in-flight run never observes a half-applied edit.
pub struct RuleBook {
    rules: RwLock<Arc<Vec<RemediationRule>>>,
    path: Option<PathBuf>,
}

impl RuleBook {
    pub fn in_memory(rules: Vec<RemediationRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            path: None,
        }
    }

    /// Loads rules from a JSON file, creating an empty one when missing.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rules: Vec<RemediationRule> = state_file::load_or_create(&path, Vec::new()).await?;
        info!(count = rules.len(), "Loaded remediation rules from {}", path.display());
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
            path: Some(path),
        })
    }

    pub async fn snapshot(&self) -> Arc<Vec<RemediationRule>> {
        self.rules.read().await.clone()
    }

    pub async fn list(&self) -> Vec<RemediationRule> {
        self.snapshot().await.as_ref().clone()
    }

    pub async fn get(&self, id: &str) -> Result<RemediationRule> {
        self.snapshot()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| HealthError::RuleNotFound { id: id.to_string() })
    }

    pub async fn enabled_count(&self) -> usize {
        self.snapshot().await.iter().filter(|r| r.enabled).count()
    }

    pub async fn create(
        &self,
        mut rule: RemediationRule,
        registry: &ProbeRegistry,
    ) -> Result<RemediationRule> {
        rule.validate(registry)?;
        let mut guard = self.rules.write().await;
        if guard.iter().any(|r| r.id == rule.id) {
            return Err(HealthError::Validation(format!(
                "a rule with id {} already exists",
                rule.id
            )));
        }
        let now = Utc::now();
        rule.created_at = now;
        rule.updated_at = now;

        let mut next = guard.as_ref().clone();
        next.push(rule.clone());
        self.commit(&mut guard, next).await?;
        info!(rule_id = %rule.id, module = %rule.module, "Remediation rule created");
        Ok(rule)
    }

    pub async fn update(
        &self,
        id: &str,
        mut rule: RemediationRule,
        registry: &ProbeRegistry,
    ) -> Result<RemediationRule> {
        rule.id = id.to_string();
        rule.validate(registry)?;
        let mut guard = self.rules.write().await;
        let mut next = guard.as_ref().clone();
        let slot = next
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| HealthError::RuleNotFound { id: id.to_string() })?;
        rule.created_at = slot.created_at;
        rule.updated_at = Utc::now();
        *slot = rule.clone();
        self.commit(&mut guard, next).await?;
        info!(rule_id = %id, "Remediation rule updated");
        Ok(rule)
    }

    pub async fn delete(&self, id: &str) -> Result<RemediationRule> {
        let mut guard = self.rules.write().await;
        let mut next = guard.as_ref().clone();
        let index = next
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| HealthError::RuleNotFound { id: id.to_string() })?;
        let removed = next.remove(index);
        self.commit(&mut guard, next).await?;
        info!(rule_id = %id, "Remediation rule deleted");
        Ok(removed)
    }

    /// Flips `enabled` and returns the updated rule.
    pub async fn toggle(&self, id: &str) -> Result<RemediationRule> {
        let mut guard = self.rules.write().await;
        let mut next = guard.as_ref().clone();
        let rule = next
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| HealthError::RuleNotFound { id: id.to_string() })?;
        rule.enabled = !rule.enabled;
        rule.updated_at = Utc::now();
        let toggled = rule.clone();
        self.commit(&mut guard, next).await?;
        info!(rule_id = %id, enabled = toggled.enabled, "Remediation rule toggled");
        Ok(toggled)
    }

    async fn commit(
        &self,
        guard: &mut tokio::sync::RwLockWriteGuard<'_, Arc<Vec<RemediationRule>>>,
        next: Vec<RemediationRule>,
    ) -> Result<()> {
        if let Some(path) = &self.path {
            state_file::save(path, &next).await?;
        }
        **guard = Arc::new(next);
        Ok(())
    }
}

/// Evaluates rules for one freshly stored result and carries out the ones
/// that fire.
pub struct RemediationEngine {
    executor: Arc<dyn ActionExecutor>,
    store: Arc<dyn ResultStore>,
    runner: ProbeRunner,
    action_timeout: Duration,
}

impl RemediationEngine {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn ResultStore>,
        runner: ProbeRunner,
        action_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            runner,
            action_timeout,
        }
    }

    /// Returns one log per rule that fired or was skipped for budget.
    /// Cooldown suppressions produce nothing.
    ///
    /// `probe` is used for the post-remediation re-probe; without it
    /// `health_score_after` stays empty.
    #[instrument(skip_all, fields(module = %result.module))]
    pub async fn evaluate(
        &self,
        rules: &[RemediationRule],
        result: &ModuleCheckResult,
        probe: Option<&dyn Probe>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RemediationLog>> {
        let applicable: Vec<&RemediationRule> = rules
            .iter()
            .filter(|r| r.enabled && r.module == result.module)
            .collect();
        if applicable.is_empty() {
            return Ok(Vec::new());
        }

        let depth = applicable
            .iter()
            .map(|r| r.condition.history_depth())
            .max()
            .unwrap_or(0);
        let history = if depth > 0 {
            self.store.history(&result.module, depth).await?
        } else {
            Vec::new()
        };

        let mut logs = Vec::new();
        for rule in applicable {
            if !rule.condition.evaluate(result, &history) {
                continue;
            }
            if let Some(log) = self.apply(rule, result, probe, now).await? {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    async fn apply(
        &self,
        rule: &RemediationRule,
        result: &ModuleCheckResult,
        probe: Option<&dyn Probe>,
        now: DateTime<Utc>,
    ) -> Result<Option<RemediationLog>> {
        let attempts = self
            .store
            .remediation_attempts_since(&rule.id, now - rule.accounting_window())
            .await?;

        if attempts.iter().any(|a| now - a.timestamp < rule.cooldown()) {
            debug!(rule_id = %rule.id, "Rule in cooldown, suppressing");
            return Ok(None);
        }

        let in_window = attempts
            .iter()
            .filter(|a| now - a.timestamp < rule.window())
            .count();
        if in_window >= rule.max_triggers_per_window as usize {
            warn!(
                rule_id = %rule.id,
                attempts = in_window,
                max = rule.max_triggers_per_window,
                "Remediation budget exhausted, skipping"
            );
            let log = RemediationLog {
                id: Uuid::new_v4(),
                rule_id: rule.id.clone(),
                module: result.module.clone(),
                success: false,
                skipped: true,
                skip_reason: Some(BUDGET_EXHAUSTED.to_string()),
                actions_executed: Vec::new(),
                error: None,
                health_score_before: result.score,
                health_score_after: None,
                timestamp: now,
            };
            self.store.save_remediation_log(log.clone()).await?;
            return Ok(Some(log));
        }

        info!(rule_id = %rule.id, score = result.score, "Remediation rule fired");
        let mut executed = Vec::new();
        let mut errors = Vec::new();
        for action in &rule.actions {
            executed.push(action.clone());
            if let Err(e) = self.run_action(action, &result.module).await {
                warn!(rule_id = %rule.id, action = %action, "{e}");
                errors.push(e.to_string());
                if !rule.continue_on_action_failure {
                    break;
                }
            }
        }

        let health_score_after = match probe {
            Some(probe) => {
                let outcome = self.runner.run(&result.module, probe).await;
                outcome.failure.is_none().then_some(outcome.result.score)
            }
            None => None,
        };

        // Without a re-probe the action results alone decide.
        let actions_ok = errors.is_empty();
        let success = actions_ok && health_score_after.map_or(true, |after| after > result.score);
        let log = RemediationLog {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            module: result.module.clone(),
            success,
            skipped: false,
            skip_reason: None,
            actions_executed: executed,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            health_score_before: result.score,
            health_score_after,
            timestamp: now,
        };
        self.store.save_remediation_log(log.clone()).await?;
        Ok(Some(log))
    }

    async fn run_action(&self, action: &str, module: &str) -> Result<()> {
        let call = AssertUnwindSafe(self.executor.execute(action, module)).catch_unwind();
        match tokio::time::timeout(self.action_timeout, call).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(HealthError::RemediationAction {
                action: action.to_string(),
                reason: format!("{e:#}"),
            }),
            Ok(Err(panic)) => Err(HealthError::RemediationAction {
                action: action.to_string(),
                reason: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
            Err(_) => Err(HealthError::RemediationAction {
                action: action.to_string(),
                reason: format!("timed out after {}s", self.action_timeout.as_secs()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::probes::FnProbe;
    use crate::monitoring::store::{InMemoryResultStore, RemediationLogFilter};
    use crate::monitoring::{CheckOutcome, ProbeReport};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        failing: Vec<String>,
        panicking: Vec<String>,
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(&self, action: &str, _module: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(action.to_string());
            if self.panicking.iter().any(|a| a == action) {
                panic!("{action} crashed");
            }
            if self.failing.iter().any(|a| a == action) {
                anyhow::bail!("{action} exited with status 1");
            }
            Ok(())
        }
    }

    fn result(module: &str, score: u8) -> ModuleCheckResult {
        ModuleCheckResult {
            sequence: 0,
            module: module.to_string(),
            status: HealthStatus::from_score(score),
            score,
            checks: vec![CheckOutcome::fail("ping", "timeout")],
            warnings: vec![],
            errors: vec!["Redis connection refused".into()],
            metrics: Default::default(),
            execution_time_ms: 3,
            timestamp: Utc::now(),
        }
    }

    fn engine(executor: Arc<RecordingExecutor>, store: Arc<InMemoryResultStore>) -> RemediationEngine {
        RemediationEngine::new(
            executor,
            store,
            ProbeRunner::new(Duration::from_secs(5)),
            Duration::from_secs(5),
        )
    }

    fn score_rule(id: &str, cooldown: u64, max: u32) -> RemediationRule {
        let mut rule = RemediationRule::new(
            id,
            "queue",
            RuleCondition::ScoreBelow { threshold: 50 },
            vec!["restart-queue".into()],
        );
        rule.cooldown_seconds = cooldown;
        rule.max_triggers_per_window = max;
        rule
    }

    #[test]
    fn conditions_evaluate_against_latest_and_history() {
        let latest = result("queue", 30);
        assert!(RuleCondition::ScoreBelow { threshold: 50 }.evaluate(&latest, &[]));
        assert!(RuleCondition::StatusAtLeast {
            status: HealthStatus::Degraded
        }
        .evaluate(&latest, &[]));
        assert!(RuleCondition::CheckFailed { check: "ping".into() }.evaluate(&latest, &[]));
        assert!(RuleCondition::ErrorContains { pattern: "redis".into() }.evaluate(&latest, &[]));
        assert!(!RuleCondition::WarningContains { pattern: "redis".into() }.evaluate(&latest, &[]));

        let consecutive = RuleCondition::ConsecutiveStatus {
            status: HealthStatus::Unhealthy,
            runs: 3,
        };
        assert!(!consecutive.evaluate(&latest, &[latest.clone(), latest.clone()]));
        assert!(consecutive.evaluate(&latest, &[latest.clone(), latest.clone(), latest.clone()]));
        let recovered = result("queue", 95);
        assert!(!consecutive.evaluate(&latest, &[latest.clone(), recovered, latest.clone()]));

        let any = RuleCondition::Any {
            conditions: vec![
                RuleCondition::ScoreBelow { threshold: 10 },
                RuleCondition::CheckFailed { check: "ping".into() },
            ],
        };
        assert!(any.evaluate(&latest, &[]));
        assert_eq!(
            RuleCondition::All {
                conditions: vec![consecutive, any]
            }
            .history_depth(),
            3
        );
    }

    #[test]
    fn condition_json_uses_type_tag() {
        let condition: RuleCondition =
            serde_json::from_str(r#"{"type":"consecutive_status","status":"UNHEALTHY","runs":2}"#)
                .unwrap();
        assert_eq!(
            condition,
            RuleCondition::ConsecutiveStatus {
                status: HealthStatus::Unhealthy,
                runs: 2
            }
        );
        assert!(RuleCondition::ScoreBelow { threshold: 101 }.validate().is_err());
        assert!(RuleCondition::Any { conditions: vec![] }.validate().is_err());
    }

    #[tokio::test]
    async fn rule_book_rejects_unknown_module_and_duplicates() {
        let mut registry = ProbeRegistry::new();
        registry.register(
            "queue",
            Arc::new(FnProbe::new(|| async { Ok(ProbeReport::default()) })),
        );
        let book = RuleBook::in_memory(Vec::new());

        let mut stray = score_rule("stray", 0, 1);
        stray.module = "payments".into();
        assert!(matches!(
            book.create(stray, &registry).await,
            Err(HealthError::UnknownModule { .. })
        ));

        book.create(score_rule("r1", 0, 1), &registry).await.unwrap();
        assert!(book.create(score_rule("r1", 0, 1), &registry).await.is_err());

        let toggled = book.toggle("r1").await.unwrap();
        assert!(!toggled.enabled);
        assert_eq!(book.enabled_count().await, 0);
        assert!(matches!(
            book.delete("missing").await,
            Err(HealthError::RuleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_is_unaffected_by_later_edits() {
        let mut registry = ProbeRegistry::new();
        registry.register(
            "queue",
            Arc::new(FnProbe::new(|| async { Ok(ProbeReport::default()) })),
        );
        let book = RuleBook::in_memory(vec![score_rule("r1", 0, 1)]);
        let before = book.snapshot().await;
        let mut edited = score_rule("r1", 0, 1);
        edited.actions = vec!["flush-queue".into(), "restart-queue".into()];
        book.update("r1", edited, &registry).await.unwrap();

        assert_eq!(before[0].actions, vec!["restart-queue"]);
        assert_eq!(book.get("r1").await.unwrap().actions.len(), 2);
    }

    #[tokio::test]
    async fn rule_book_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let mut registry = ProbeRegistry::new();
        registry.register(
            "queue",
            Arc::new(FnProbe::new(|| async { Ok(ProbeReport::default()) })),
        );

        let book = RuleBook::load(&path).await.unwrap();
        book.create(score_rule("r1", 300, 2), &registry).await.unwrap();

        let reloaded = RuleBook::load(&path).await.unwrap();
        let rule = reloaded.get("r1").await.unwrap();
        assert_eq!(rule.cooldown_seconds, 300);
        assert_eq!(rule.max_triggers_per_window, 2);
    }

    #[tokio::test]
    async fn cooldown_suppresses_silently() {
        let store = Arc::new(InMemoryResultStore::new());
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(executor.clone(), store.clone());
        let rules = vec![score_rule("restart", 60, 10)];
        let latest = result("queue", 30);
        let t0 = Utc::now();

        let fired = engine.evaluate(&rules, &latest, None, t0).await.unwrap();
        assert_eq!(fired.len(), 1);

        let at_30 = engine
            .evaluate(&rules, &latest, None, t0 + ChronoDuration::seconds(30))
            .await
            .unwrap();
        assert!(at_30.is_empty());

        let at_60 = engine
            .evaluate(&rules, &latest, None, t0 + ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(at_60.len(), 1);
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn budget_caps_attempts_and_logs_skip() {
        let store = Arc::new(InMemoryResultStore::new());
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(executor.clone(), store.clone());
        let rules = vec![score_rule("restart", 0, 2)];
        let latest = result("queue", 30);
        let t0 = Utc::now();

        for i in 0..5 {
            engine
                .evaluate(&rules, &latest, None, t0 + ChronoDuration::seconds(i))
                .await
                .unwrap();
        }

        assert_eq!(executor.calls.lock().unwrap().len(), 2);
        let logs = store
            .remediation_logs(&RemediationLogFilter::default())
            .await
            .unwrap();
        assert_eq!(logs.iter().filter(|l| !l.skipped).count(), 2);
        let skipped: Vec<_> = logs.iter().filter(|l| l.skipped).collect();
        assert_eq!(skipped.len(), 3);
        assert!(skipped
            .iter()
            .all(|l| l.skip_reason.as_deref() == Some(BUDGET_EXHAUSTED)));
        assert!(logs_contain("Remediation budget exhausted"));
    }

    #[tokio::test]
    async fn first_failing_action_stops_the_sequence() {
        let store = Arc::new(InMemoryResultStore::new());
        let executor = Arc::new(RecordingExecutor {
            failing: vec!["flush-queue".into()],
            ..Default::default()
        });
        let engine = engine(executor.clone(), store.clone());
        let mut rule = score_rule("restart", 0, 5);
        rule.actions = vec!["flush-queue".into(), "restart-queue".into()];

        let logs = engine
            .evaluate(&[rule.clone()], &result("queue", 30), None, Utc::now())
            .await
            .unwrap();
        assert!(!logs[0].success);
        assert_eq!(logs[0].actions_executed, vec!["flush-queue"]);
        assert!(logs[0].error.as_deref().unwrap().contains("flush-queue"));

        rule.id = "restart-anyway".into();
        rule.continue_on_action_failure = true;
        let logs = engine
            .evaluate(&[rule], &result("queue", 30), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(logs[0].actions_executed, vec!["flush-queue", "restart-queue"]);
    }

    #[tokio::test]
    async fn panicking_action_is_recorded_as_failure() {
        let store = Arc::new(InMemoryResultStore::new());
        let executor = Arc::new(RecordingExecutor {
            panicking: vec!["flush-queue".into()],
            ..Default::default()
        });
        let engine = engine(executor.clone(), store.clone());
        let mut rule = score_rule("restart", 0, 5);
        rule.actions = vec!["flush-queue".into(), "restart-queue".into()];

        let logs = engine
            .evaluate(&[rule], &result("queue", 30), None, Utc::now())
            .await
            .unwrap();
        assert!(!logs[0].success);
        assert_eq!(logs[0].actions_executed, vec!["flush-queue"]);
        assert!(logs[0].error.as_deref().unwrap().contains("flush-queue crashed"));
        let stored = store
            .remediation_logs(&RemediationLogFilter::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn success_requires_an_improved_score() {
        let store = Arc::new(InMemoryResultStore::new());
        let engine = engine(Arc::new(RecordingExecutor::default()), store);
        let unchanged = FnProbe::new(|| async {
            Ok(ProbeReport::with_checks(
                (0..10)
                    .map(|i| {
                        if i < 3 {
                            CheckOutcome::pass(format!("c{i}"))
                        } else {
                            CheckOutcome::fail(format!("c{i}"), "down")
                        }
                    })
                    .collect(),
            ))
        });

        let logs = engine
            .evaluate(&[score_rule("a", 0, 5)], &result("queue", 30), Some(&unchanged as &dyn Probe), Utc::now())
            .await
            .unwrap();
        assert_eq!(logs[0].health_score_after, Some(30));
        assert!(logs[0].error.is_none());
        assert!(!logs[0].success);
    }

    #[tokio::test]
    async fn re_probe_fills_score_after_unless_it_fails() {
        let store = Arc::new(InMemoryResultStore::new());
        let engine = engine(Arc::new(RecordingExecutor::default()), store);
        let healed = FnProbe::new(|| async {
            Ok(ProbeReport::with_checks(vec![CheckOutcome::pass("ping")]))
        });
        let broken = FnProbe::new(|| async { Err::<ProbeReport, _>(anyhow::anyhow!("still down")) });

        let logs = engine
            .evaluate(&[score_rule("a", 0, 5)], &result("queue", 30), Some(&healed as &dyn Probe), Utc::now())
            .await
            .unwrap();
        assert_eq!(logs[0].health_score_before, 30);
        assert_eq!(logs[0].health_score_after, Some(100));
        assert!(logs[0].success);

        let logs = engine
            .evaluate(&[score_rule("b", 0, 5)], &result("queue", 30), Some(&broken as &dyn Probe), Utc::now())
            .await
            .unwrap();
        assert_eq!(logs[0].health_score_after, None);
        assert!(logs[0].success);
    }

    #[tokio::test]
    async fn disabled_and_foreign_rules_are_ignored() {
        let store = Arc::new(InMemoryResultStore::new());
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine(executor.clone(), store);
        let mut disabled = score_rule("off", 0, 5);
        disabled.enabled = false;
        let mut foreign = score_rule("db", 0, 5);
        foreign.module = "database-health".into();

        let logs = engine
            .evaluate(&[disabled, foreign], &result("queue", 30), None, Utc::now())
            .await
            .unwrap();
        assert!(logs.is_empty());
        assert!(executor.calls.lock().unwrap().is_empty());
    }
}
