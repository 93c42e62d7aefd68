//! Background scheduling for periodic health check runs.
//!
//! Jobs sharing one `JobScheduler`:
//!
//! - the periodic run, re-created whenever the interval or the automation
//!   flag changes
//! - performance sampling
//! - daily retention pruning
//! - the weekly report, when a report generator is attached
//!
//! Overlap is prevented by the orchestrator's run lock; a periodic tick that
//! finds a run in flight is counted as skipped, never queued.

use super::orchestrator::{Orchestrator, RunSummary};
use super::performance::PerformanceMonitor;
use super::remediation::RemediationRule;
use super::report::{ReportFormat, ReportGenerator};
use super::state_file;
use super::HealthStatus;
use crate::error::{HealthError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const MIN_INTERVAL_SECONDS: u64 = 10;
pub const MAX_INTERVAL_SECONDS: u64 = 7 * 24 * 3600;

/// Daily at 02:00 UTC.
const RETENTION_CRON: &str = "0 0 2 * * *";
/// Mondays at 09:00 UTC.
const WEEKLY_REPORT_CRON: &str = "0 0 9 * * Mon";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_seconds: u64,
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1800,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub enabled: Option<bool>,
    pub interval_seconds: Option<u64>,
}

pub fn validate_interval(seconds: u64) -> Result<()> {
    if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&seconds) {
        return Err(HealthError::Configuration(format!(
            "interval must be between {MIN_INTERVAL_SECONDS} and {MAX_INTERVAL_SECONDS} seconds, got {seconds}"
        )));
    }
    Ok(())
}

/// The single mutable schedule record, optionally mirrored to a JSON file.
pub struct ScheduleState {
    config: RwLock<ScheduleConfig>,
    path: Option<PathBuf>,
}

impl ScheduleState {
    pub fn in_memory(config: ScheduleConfig) -> Self {
        Self {
            config: RwLock::new(config),
            path: None,
        }
    }

    pub async fn load(path: impl Into<PathBuf>, default: ScheduleConfig) -> Result<Self> {
        let path = path.into();
        let config = state_file::load_or_create(&path, default).await?;
        validate_interval(config.interval_seconds)?;
        Ok(Self {
            config: RwLock::new(config),
            path: Some(path),
        })
    }

    pub async fn get(&self) -> ScheduleConfig {
        self.config.read().await.clone()
    }

    pub async fn is_enabled(&self) -> bool {
        self.config.read().await.enabled
    }

    /// Applies an operator change. Disabling only stops future periodic
    /// runs; a run already started is left alone.
    pub async fn update(&self, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        if let Some(interval) = update.interval_seconds {
            validate_interval(interval)?;
        }
        let mut config = self.config.write().await;
        let mut next = config.clone();
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(interval) = update.interval_seconds {
            next.interval_seconds = interval;
        }
        if !next.enabled {
            next.next_run_at = None;
        }
        self.persist(&next).await?;
        *config = next.clone();
        info!(
            enabled = next.enabled,
            interval_seconds = next.interval_seconds,
            "Schedule updated"
        );
        Ok(next)
    }

    pub async fn record_run(&self, started_at: DateTime<Utc>) -> Result<()> {
        let mut config = self.config.write().await;
        config.last_run_at = Some(started_at);
        self.persist(&config).await
    }

    pub async fn set_next_run(&self, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut config = self.config.write().await;
        config.next_run_at = next_run_at;
        self.persist(&config).await
    }

    /// Records the next periodic run unless automation was switched off in
    /// the meantime. Returns the value actually stored.
    pub async fn schedule_next_run(
        &self,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut config = self.config.write().await;
        config.next_run_at = config.enabled.then_some(next_run_at);
        self.persist(&config).await?;
        Ok(config.next_run_at)
    }

    async fn persist(&self, config: &ScheduleConfig) -> Result<()> {
        match &self.path {
            Some(path) => state_file::save(path, config).await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    Stopped,
    Running,
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Ticks that found automation disabled or another run in flight.
    pub skipped_runs: u64,
    pub avg_run_duration_ms: f64,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub last_failed_run: Option<DateTime<Utc>>,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub status: SchedulerStatus,
}

impl Default for SchedulerStatistics {
    fn default() -> Self {
        Self {
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            skipped_runs: 0,
            avg_run_duration_ms: 0.0,
            last_successful_run: None,
            last_failed_run: None,
            next_scheduled_run: None,
            status: SchedulerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    SkippedDisabled,
    SkippedInProgress,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub performance_sample_interval: Option<Duration>,
    pub retention_days: u32,
    /// Format of the Monday report; `None` disables it.
    pub weekly_report: Option<ReportFormat>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            performance_sample_interval: Some(Duration::from_secs(60)),
            retention_days: 30,
            weekly_report: Some(ReportFormat::Json),
        }
    }
}

/// Oldest timestamp retention may delete up to. Never cuts into a rule's
/// cooldown or budget window, so pruning cannot re-arm a rule.
pub fn retention_cutoff(
    now: DateTime<Utc>,
    retention_days: u32,
    rules: &[RemediationRule],
) -> DateTime<Utc> {
    let retention = ChronoDuration::days(retention_days as i64);
    let keep = rules
        .iter()
        .map(RemediationRule::accounting_window)
        .fold(retention, |keep, window| keep.max(window));
    now - keep
}

/// State shared between the scheduler handle and its job closures.
struct SchedulerCore {
    orchestrator: Arc<Orchestrator>,
    statistics: RwLock<SchedulerStatistics>,
}

impl SchedulerCore {
    #[instrument(skip(self))]
    async fn tick(&self) -> TickOutcome {
        let schedule = self.orchestrator.schedule();
        let config = schedule.get().await;
        if !config.enabled {
            debug!("Automation disabled, skipping periodic run");
            self.statistics.write().await.skipped_runs += 1;
            return TickOutcome::SkippedDisabled;
        }

        let prior = {
            let mut stats = self.statistics.write().await;
            std::mem::replace(&mut stats.status, SchedulerStatus::Processing)
        };
        let outcome = self.orchestrator.run_scheduled().await;
        let now = Utc::now();
        let next = match schedule
            .schedule_next_run(now + ChronoDuration::seconds(config.interval_seconds as i64))
            .await
        {
            Ok(next) => next,
            Err(e) => {
                warn!("Failed to persist next run time: {}", e);
                schedule.get().await.next_run_at
            }
        };

        let mut stats = self.statistics.write().await;
        stats.status = prior;
        stats.next_scheduled_run = next;
        match outcome {
            Ok(summary) => {
                stats.total_runs += 1;
                stats.successful_runs += 1;
                stats.last_successful_run = Some(summary.completed_at);
                stats.avg_run_duration_ms = ((stats.avg_run_duration_ms
                    * (stats.successful_runs - 1) as f64)
                    + summary.duration_ms as f64)
                    / stats.successful_runs as f64;
                TickOutcome::Completed
            }
            Err(HealthError::RunInProgress) => {
                warn!("A health check run is already in progress, skipping this scheduled run");
                stats.skipped_runs += 1;
                TickOutcome::SkippedInProgress
            }
            Err(e) => {
                stats.total_runs += 1;
                stats.failed_runs += 1;
                stats.last_failed_run = Some(now);
                TickOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Drives periodic runs, performance sampling and retention.
pub struct HealthScheduler {
    scheduler: Arc<Mutex<JobScheduler>>,
    core: Arc<SchedulerCore>,
    performance: Option<Arc<PerformanceMonitor>>,
    reports: Option<Arc<ReportGenerator>>,
    settings: SchedulerSettings,
    run_job_id: Mutex<Option<Uuid>>,
}

impl HealthScheduler {
    pub async fn new(
        orchestrator: Arc<Orchestrator>,
        performance: Option<Arc<PerformanceMonitor>>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(|e| {
            HealthError::Scheduler(format!("Failed to initialize job scheduler: {}", e))
        })?;

        Ok(Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            core: Arc::new(SchedulerCore {
                orchestrator,
                statistics: RwLock::new(SchedulerStatistics::default()),
            }),
            performance,
            reports: None,
            settings,
            run_job_id: Mutex::new(None),
        })
    }

    pub fn with_reports(mut self, reports: Arc<ReportGenerator>) -> Self {
        self.reports = Some(reports);
        self
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!(
            retention_days = self.settings.retention_days,
            "Starting health check scheduler"
        );

        self.add_retention_job().await?;
        if let (Some(reports), Some(format)) = (&self.reports, self.settings.weekly_report) {
            self.add_weekly_report_job(reports.clone(), format).await?;
        }
        if let (Some(monitor), Some(interval)) =
            (&self.performance, self.settings.performance_sample_interval)
        {
            self.add_sampling_job(monitor.clone(), interval).await?;
        }

        {
            let sched = self.scheduler.lock().await;
            sched
                .start()
                .await
                .map_err(|e| HealthError::Scheduler(format!("Failed to start job scheduler: {}", e)))?;
        }
        self.core.statistics.write().await.status = SchedulerStatus::Running;

        self.reschedule().await?;
        info!("Health check scheduler started successfully");
        Ok(())
    }

    /// Runs one periodic tick immediately, with the same skip rules as the
    /// background job.
    pub async fn tick(&self) -> TickOutcome {
        self.core.tick().await
    }

    /// Startup run over all modules. Behaves like a manual run, so it also
    /// happens while automation is disabled.
    #[instrument(skip(self))]
    pub async fn run_initial_check(&self) -> Result<RunSummary> {
        info!("Running initial health check");
        match self.core.orchestrator.run_manual(None).await {
            Ok(summary) => {
                for result in summary
                    .results
                    .iter()
                    .filter(|r| r.status == HealthStatus::Unhealthy)
                {
                    warn!(module = %result.module, score = result.score, "Module unhealthy at startup");
                }
                info!(overall = ?summary.overall, "Initial health check completed");
                Ok(summary)
            }
            Err(e) => {
                error!("Initial health check failed: {}", e);
                Err(e)
            }
        }
    }

    /// Applies a schedule change and rebuilds the periodic job if the
    /// scheduler is running.
    pub async fn update_schedule(&self, update: ScheduleUpdate) -> Result<ScheduleConfig> {
        let schedule = self.core.orchestrator.schedule();
        schedule.update(update).await?;
        if self.is_running().await {
            self.reschedule().await?;
        }
        Ok(schedule.get().await)
    }

    async fn reschedule(&self) -> Result<()> {
        let schedule = self.core.orchestrator.schedule();
        let config = schedule.get().await;
        let sched = self.scheduler.lock().await;
        let mut job_id = self.run_job_id.lock().await;

        if let Some(existing) = job_id.take() {
            sched.remove(&existing).await.map_err(|e| {
                HealthError::Scheduler(format!("Failed to remove periodic job: {}", e))
            })?;
        }

        if !config.enabled {
            info!("Automation disabled, periodic runs paused");
            schedule.set_next_run(None).await?;
            self.core.statistics.write().await.next_scheduled_run = None;
            return Ok(());
        }

        let interval = Duration::from_secs(config.interval_seconds);
        let core = self.core.clone();
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let core = core.clone();
            Box::pin(async move {
                match core.tick().await {
                    TickOutcome::Failed(reason) => error!("Scheduled health check failed: {}", reason),
                    outcome => debug!(?outcome, "Scheduled health check tick finished"),
                }
            })
        })
        .map_err(|e| HealthError::Scheduler(format!("Failed to create periodic job: {}", e)))?;

        let id = sched
            .add(job)
            .await
            .map_err(|e| HealthError::Scheduler(format!("Failed to add periodic job: {}", e)))?;
        *job_id = Some(id);

        let next = Utc::now() + ChronoDuration::seconds(config.interval_seconds as i64);
        schedule.set_next_run(Some(next)).await?;
        self.core.statistics.write().await.next_scheduled_run = Some(next);
        info!(job_id = %id, interval_seconds = config.interval_seconds, "Periodic health checks scheduled");
        Ok(())
    }

    async fn add_retention_job(&self) -> Result<()> {
        let orchestrator = self.core.orchestrator.clone();
        let retention_days = self.settings.retention_days;
        let job = Job::new_async(RETENTION_CRON, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                let rules = orchestrator.rules().snapshot().await;
                let cutoff = retention_cutoff(Utc::now(), retention_days, &rules);
                match orchestrator.store().prune_before(cutoff).await {
                    Ok(report) => info!(
                        results = report.results_removed,
                        samples = report.samples_removed,
                        remediation_logs = report.remediation_logs_removed,
                        "Retention pruning completed"
                    ),
                    Err(e) => error!("Retention pruning failed: {}", e),
                }
            })
        })
        .map_err(|e| HealthError::Scheduler(format!("Failed to create retention job: {}", e)))?;

        let sched = self.scheduler.lock().await;
        sched
            .add(job)
            .await
            .map_err(|e| HealthError::Scheduler(format!("Failed to add retention job: {}", e)))?;
        Ok(())
    }

    async fn add_weekly_report_job(
        &self,
        reports: Arc<ReportGenerator>,
        format: ReportFormat,
    ) -> Result<()> {
        let job = Job::new_async(WEEKLY_REPORT_CRON, move |_uuid, _l| {
            let reports = reports.clone();
            Box::pin(async move {
                match reports.generate_default_period(format).await {
                    Ok(report) => info!(file = %report.file_name, "Weekly health report generated"),
                    Err(e) => error!("Weekly health report failed: {}", e),
                }
            })
        })
        .map_err(|e| HealthError::Scheduler(format!("Failed to create weekly report job: {}", e)))?;

        let sched = self.scheduler.lock().await;
        sched
            .add(job)
            .await
            .map_err(|e| HealthError::Scheduler(format!("Failed to add weekly report job: {}", e)))?;
        Ok(())
    }

    async fn add_sampling_job(&self, monitor: Arc<PerformanceMonitor>, interval: Duration) -> Result<()> {
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let monitor = monitor.clone();
            Box::pin(async move {
                if let Err(e) = monitor.sample_and_store().await {
                    warn!("Performance sampling failed: {}", e);
                }
            })
        })
        .map_err(|e| HealthError::Scheduler(format!("Failed to create sampling job: {}", e)))?;

        let sched = self.scheduler.lock().await;
        sched
            .add(job)
            .await
            .map_err(|e| HealthError::Scheduler(format!("Failed to add sampling job: {}", e)))?;
        Ok(())
    }

    /// Stops all jobs. A run already in progress finishes on its own.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down health check scheduler");
        {
            let mut sched = self.scheduler.lock().await;
            sched.shutdown().await.map_err(|e| {
                HealthError::Scheduler(format!("Failed to shutdown job scheduler: {}", e))
            })?;
        }
        let mut stats = self.core.statistics.write().await;
        stats.status = SchedulerStatus::Stopped;
        stats.next_scheduled_run = None;
        info!("Health check scheduler shutdown completed");
        Ok(())
    }

    pub async fn get_statistics(&self) -> SchedulerStatistics {
        self.core.statistics.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        let stats = self.core.statistics.read().await;
        matches!(
            stats.status,
            SchedulerStatus::Running | SchedulerStatus::Processing
        )
    }
}
