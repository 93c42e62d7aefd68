use super::metrics::HealthMetrics;
use super::notifications::{deliver, LogNotificationSink, Notification, NotificationSink};
use super::probes::{Probe, ProbeOutcome, ProbeRegistry, ProbeRunner};
use super::remediation::{ActionExecutor, RemediationEngine, RemediationLog, RemediationRule, RuleBook};
use super::scheduler::ScheduleState;
use super::scoring::mean_score;
use super::store::{InMemoryResultStore, ResultStore};
use super::{HealthStatus, HealthSummary, ModuleCheckResult, ModuleSummary};
use crate::error::{HealthError, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// What a manual run does when another run is already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Reject,
    Queue,
}

impl FromStr for OverlapPolicy {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverlapPolicy::Reject),
            "queue" => Ok(OverlapPolicy::Queue),
            other => Err(HealthError::Configuration(format!(
                "unknown run overlap policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub module_filter: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub overall_score: Option<u8>,
    pub overall: Option<HealthStatus>,
    pub results: Vec<ModuleCheckResult>,
    pub remediation_triggered: bool,
    pub remediations: Vec<RemediationLog>,
}

impl RunSummary {
    pub fn result(&self, module: &str) -> Option<&ModuleCheckResult> {
        self.results.iter().find(|r| r.module == module)
    }
}

/// Composes probes, scoring, the store and remediation into runs.
///
/// At most one run executes at a time; the run lock is the only shared
/// mutable state touched on the hot path.
pub struct Orchestrator {
    registry: Arc<ProbeRegistry>,
    runner: ProbeRunner,
    store: Arc<dyn ResultStore>,
    rules: Arc<RuleBook>,
    engine: RemediationEngine,
    notifier: Arc<dyn NotificationSink>,
    schedule: Arc<ScheduleState>,
    metrics: Arc<HealthMetrics>,
    run_lock: Mutex<()>,
    overlap_policy: OverlapPolicy,
    max_concurrent_probes: usize,
}

impl Orchestrator {
    pub fn builder(registry: ProbeRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder::new(registry)
    }

    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn ResultStore> {
        self.store.clone()
    }

    pub fn rules(&self) -> Arc<RuleBook> {
        self.rules.clone()
    }

    pub fn schedule(&self) -> Arc<ScheduleState> {
        self.schedule.clone()
    }

    pub fn metrics(&self) -> Arc<HealthMetrics> {
        self.metrics.clone()
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap_policy
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Operator-requested run over all modules, or just `module`. Works
    /// whether or not automation is enabled.
    pub async fn run_manual(&self, module: Option<&str>) -> Result<RunSummary> {
        if let Some(module) = module {
            self.registry.get(module)?;
        }
        let guard = match self.overlap_policy {
            OverlapPolicy::Queue => self.run_lock.lock().await,
            OverlapPolicy::Reject => self.try_acquire()?,
        };
        self.execute(RunTrigger::Manual, module, guard).await
    }

    /// Periodic run over all modules. Never waits for an in-flight run.
    pub async fn run_scheduled(&self) -> Result<RunSummary> {
        let guard = self.try_acquire()?;
        self.execute(RunTrigger::Scheduled, None, guard).await
    }

    fn try_acquire(&self) -> Result<MutexGuard<'_, ()>> {
        self.run_lock.try_lock().map_err(|_| {
            self.metrics.runs_rejected_total.inc();
            HealthError::RunInProgress
        })
    }

    async fn execute(
        &self,
        trigger: RunTrigger,
        module: Option<&str>,
        _guard: MutexGuard<'_, ()>,
    ) -> Result<RunSummary> {
        match self.run_locked(trigger, module).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.metrics.runs_failed_total.inc();
                error!(trigger = %trigger, "Health check run could not complete: {}", e);
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(run_id))]
    async fn run_locked(&self, trigger: RunTrigger, module: Option<&str>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let started_at = Utc::now();
        let clock = Instant::now();

        // One snapshot per run: edits made while probes execute apply next time.
        let rules = self.rules.snapshot().await;

        let targets: Vec<(String, Arc<dyn Probe>)> = match module {
            Some(module) => vec![(module.to_string(), self.registry.get(module)?)],
            None => self
                .registry
                .entries()
                .map(|(name, probe)| (name.clone(), probe.clone()))
                .collect(),
        };
        info!(modules = targets.len(), "Starting health check run");

        let probes: Vec<BoxFuture<'static, ProbeOutcome>> = targets
            .iter()
            .cloned()
            .map(|(name, probe)| {
                let runner = self.runner.clone();
                async move { runner.run(&name, probe.as_ref()).await }.boxed()
            })
            .collect();
        let outcomes: Vec<ProbeOutcome> = stream::iter(probes)
            .buffered(self.max_concurrent_probes.max(1))
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut remediations = Vec::new();
        for ((name, probe), outcome) in targets.iter().zip(outcomes) {
            let previous = self.store.latest(name).await?;
            let failure_kind = outcome.failure.as_ref().map(|f| f.check_name());
            let saved = self.store.save(outcome.result).await?;
            self.metrics.record_result(&saved, failure_kind);

            let previous_status = previous.map(|p| p.status);
            let changed = match previous_status {
                Some(status) => status != saved.status,
                None => saved.status != HealthStatus::Healthy,
            };
            if changed {
                self.notify(
                    Notification::status_changed(name, previous_status, saved.status, saved.score)
                        .with_metadata("run_id", run_id)
                        .with_metadata("trigger", trigger),
                )
                .await;
            }

            let logs = self
                .engine
                .evaluate(&rules, &saved, Some(probe.as_ref()), Utc::now())
                .await?;
            for log in &logs {
                self.metrics.record_remediation(log);
                self.notify_remediation(&rules, log, run_id).await;
            }

            results.push(saved);
            remediations.extend(logs);
        }

        let overall_score = mean_score(results.iter().map(|r| r.score));
        let overall = HealthStatus::worst(results.iter().map(|r| r.status));
        if let Err(e) = self.schedule.record_run(started_at).await {
            warn!("Failed to persist last run time: {}", e);
        }
        self.metrics.runs_total.with_label_values(&[trigger.as_str()]).inc();

        let summary = RunSummary {
            run_id,
            trigger,
            module_filter: module.map(str::to_string),
            started_at,
            completed_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            overall_score,
            overall,
            remediation_triggered: remediations.iter().any(|l| !l.skipped),
            results,
            remediations,
        };
        info!(
            overall = ?summary.overall,
            overall_score = ?summary.overall_score,
            remediations = summary.remediations.len(),
            duration_ms = summary.duration_ms,
            "Health check run completed"
        );
        Ok(summary)
    }

    async fn notify(&self, notification: Notification) {
        deliver(&self.notifier, notification, NOTIFICATION_TIMEOUT).await;
    }

    async fn notify_remediation(&self, rules: &[RemediationRule], log: &RemediationLog, run_id: Uuid) {
        if log.skipped {
            return;
        }
        let Some(rule) = rules.iter().find(|r| r.id == log.rule_id) else {
            return;
        };
        let wanted = if log.success {
            rule.notify_on_success
        } else {
            rule.notify_on_failure
        };
        if !wanted {
            return;
        }
        let mut notification =
            Notification::remediation(&log.module, &log.rule_id, log.success, log.error.clone())
                .with_metadata("run_id", run_id)
                .with_metadata("actions", log.actions_executed.join(","))
                .with_metadata("score_before", log.health_score_before);
        if let Some(after) = log.health_score_after {
            notification = notification.with_metadata("score_after", after);
        }
        self.notify(notification).await;
    }

    /// Overall state plus the latest result of every registered module.
    pub async fn summary(&self) -> Result<HealthSummary> {
        let mut modules = Vec::new();
        for module in self.registry.list_modules() {
            let latest = self.store.latest(&module).await?;
            modules.push(ModuleSummary { module, latest });
        }
        let latest: Vec<&ModuleCheckResult> =
            modules.iter().filter_map(|m| m.latest.as_ref()).collect();
        let schedule = self.schedule.get().await;

        Ok(HealthSummary {
            overall: HealthStatus::worst(latest.iter().map(|r| r.status)),
            overall_score: mean_score(latest.iter().map(|r| r.score)),
            automation_enabled: schedule.enabled,
            interval_seconds: schedule.interval_seconds,
            last_run_at: schedule.last_run_at,
            next_run_at: schedule.next_run_at,
            enabled_rules: self.rules.enabled_count().await,
            modules,
        })
    }

    /// Newest-first history of one module, or of all modules.
    pub async fn history(&self, module: Option<&str>, limit: usize) -> Result<Vec<ModuleCheckResult>> {
        match module {
            Some(module) => {
                self.registry.get(module)?;
                self.store.history(module, limit).await
            }
            None => self.store.recent(limit).await,
        }
    }
}

pub struct OrchestratorBuilder {
    registry: ProbeRegistry,
    store: Option<Arc<dyn ResultStore>>,
    rules: Option<Arc<RuleBook>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    schedule: Option<Arc<ScheduleState>>,
    metrics: Option<Arc<HealthMetrics>>,
    probe_timeout: Duration,
    action_timeout: Duration,
    max_concurrent_probes: usize,
    overlap_policy: OverlapPolicy,
}

impl OrchestratorBuilder {
    pub fn new(registry: ProbeRegistry) -> Self {
        Self {
            registry,
            store: None,
            rules: None,
            executor: None,
            notifier: None,
            schedule: None,
            metrics: None,
            probe_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(60),
            max_concurrent_probes: 4,
            overlap_policy: OverlapPolicy::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rules(mut self, rules: Arc<RuleBook>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn action_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn schedule(mut self, schedule: Arc<ScheduleState>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn max_concurrent_probes(mut self, max: usize) -> Self {
        self.max_concurrent_probes = max;
        self
    }

    pub fn overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let executor = self.executor.ok_or_else(|| {
            HealthError::Configuration("an action executor is required".to_string())
        })?;
        if self.max_concurrent_probes == 0 {
            return Err(HealthError::Configuration(
                "max_concurrent_probes must be at least 1".to_string(),
            ));
        }
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                HealthMetrics::new().map_err(|e| HealthError::Configuration(e.to_string()))?,
            ),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryResultStore::new()));
        let runner = ProbeRunner::new(self.probe_timeout);
        let engine =
            RemediationEngine::new(executor, store.clone(), runner.clone(), self.action_timeout);

        Ok(Orchestrator {
            registry: Arc::new(self.registry),
            runner,
            store,
            rules: self
                .rules
                .unwrap_or_else(|| Arc::new(RuleBook::in_memory(Vec::new()))),
            engine,
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(LogNotificationSink)),
            schedule: self
                .schedule
                .unwrap_or_else(|| Arc::new(ScheduleState::in_memory(Default::default()))),
            metrics,
            run_lock: Mutex::new(()),
            overlap_policy: self.overlap_policy,
            max_concurrent_probes: self.max_concurrent_probes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::probes::FnProbe;
    use crate::monitoring::{CheckOutcome, ProbeReport};
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl ActionExecutor for NoopExecutor {
        async fn execute(&self, _action: &str, _module: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn probe(passed: usize, total: usize) -> Arc<dyn Probe> {
        Arc::new(FnProbe::new(move || async move {
            Ok(ProbeReport::with_checks(
                (0..total)
                    .map(|i| {
                        if i < passed {
                            CheckOutcome::pass(format!("c{i}"))
                        } else {
                            CheckOutcome::fail(format!("c{i}"), "failed")
                        }
                    })
                    .collect(),
            ))
        }))
    }

    #[test]
    fn overlap_policy_parses() {
        assert_eq!("queue".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Queue);
        assert_eq!(" Reject ".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Reject);
        assert!("drop".parse::<OverlapPolicy>().is_err());
    }

    #[test]
    fn builder_requires_an_executor() {
        assert!(matches!(
            Orchestrator::builder(ProbeRegistry::new()).build(),
            Err(HealthError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn single_module_run_only_touches_that_module() {
        let mut registry = ProbeRegistry::new();
        registry.register("db", probe(10, 10)).register("queue", probe(3, 10));
        let orchestrator = Orchestrator::builder(registry)
            .action_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();

        let summary = orchestrator.run_manual(Some("queue")).await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.overall_score, Some(30));
        assert!(orchestrator.store().latest("db").await.unwrap().is_none());

        assert!(matches!(
            orchestrator.run_manual(Some("payments")).await,
            Err(HealthError::UnknownModule { .. })
        ));
    }

    #[tokio::test]
    async fn summary_reflects_latest_results() {
        let mut registry = ProbeRegistry::new();
        registry.register("db", probe(10, 10)).register("queue", probe(7, 10));
        let orchestrator = Orchestrator::builder(registry)
            .action_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();

        let empty = orchestrator.summary().await.unwrap();
        assert_eq!(empty.overall, None);
        assert!(empty.modules.iter().all(|m| m.latest.is_none()));

        orchestrator.run_manual(None).await.unwrap();
        let summary = orchestrator.summary().await.unwrap();
        assert_eq!(summary.overall, Some(HealthStatus::Degraded));
        assert_eq!(summary.overall_score, Some(85));
        assert!(summary.last_run_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_run_can_be_spawned() {
        let mut registry = ProbeRegistry::new();
        registry.register("db", probe(10, 10)).register("queue", probe(3, 10));
        let orchestrator = Arc::new(
            Orchestrator::builder(registry)
                .action_executor(Arc::new(NoopExecutor))
                .max_concurrent_probes(1)
                .build()
                .unwrap(),
        );

        let summary = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run_scheduled().await }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.trigger, RunTrigger::Scheduled);
        assert_eq!(summary.results.len(), 2);
    }
}
