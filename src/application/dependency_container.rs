use crate::{
    api::AppState,
    monitoring::{
        ApiTrafficStats, HealthMetrics, HealthScheduler, InMemoryResultStore, Orchestrator,
        PerformanceMonitor, PerformanceThresholds, PostgresResultStore, ProbeCatalog,
        ProbeRegistry, ReportFormat, ReportGenerator, ResultStore, RuleBook, ScheduleConfig,
        ScheduleState, SchedulerSettings,
    },
    Config,
};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Dependency injection container for the application
pub struct DependencyContainer {
    pub config: Config,

    // Storage layer
    pub store: Arc<dyn ResultStore>,

    // Service layer
    pub orchestrator: Arc<Orchestrator>,
    pub reports: Arc<ReportGenerator>,

    // Infrastructure layer
    pub traffic: Arc<ApiTrafficStats>,
    pub performance: Arc<PerformanceMonitor>,
}

impl DependencyContainer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing dependency container...");
        config.validate()?;

        let store = Self::create_store(&config).await?;

        let catalog = match &config.probes_file {
            Some(path) => ProbeCatalog::load(path).await?,
            None => {
                warn!("PROBES_FILE not set, no modules will be checked");
                ProbeCatalog::default()
            }
        };
        let mut registry = ProbeRegistry::new();
        catalog.register_probes(&mut registry);
        let executor = Arc::new(catalog.action_executor());

        let rules = Arc::new(RuleBook::load(config.rules_path()).await?);
        let schedule = Arc::new(
            ScheduleState::load(
                config.schedule_path(),
                ScheduleConfig {
                    interval_seconds: config.schedule.interval_seconds,
                    enabled: config.schedule.enabled,
                    ..ScheduleConfig::default()
                },
            )
            .await?,
        );

        let orchestrator = Arc::new(
            Orchestrator::builder(registry)
                .store(store.clone())
                .rules(rules)
                .schedule(schedule)
                .action_executor(executor)
                .metrics(Arc::new(HealthMetrics::new()?))
                .probe_timeout(config.probe_timeout())
                .action_timeout(config.action_timeout())
                .max_concurrent_probes(config.orchestrator.max_concurrent_probes)
                .overlap_policy(config.orchestrator.overlap_policy)
                .build()?,
        );

        let traffic = Arc::new(ApiTrafficStats::new());
        let performance = Arc::new(PerformanceMonitor::new(
            orchestrator.clone(),
            traffic.clone(),
            PerformanceThresholds::default(),
        ));
        let reports = Arc::new(ReportGenerator::new(
            store.clone(),
            config.reports_dir.clone(),
        ));

        info!(
            modules = orchestrator.registry().len(),
            store = %config.safe_database_url(),
            "Dependency container ready"
        );

        Ok(Self {
            config,
            store,
            orchestrator,
            reports,
            traffic,
            performance,
        })
    }

    async fn create_store(config: &Config) -> Result<Arc<dyn ResultStore>> {
        match &config.database_url {
            Some(url) => {
                let store =
                    PostgresResultStore::connect(url, config.operational.max_db_connections)
                        .await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
            None => {
                warn!("DATABASE_URL not set, results are kept in memory only");
                Ok(Arc::new(InMemoryResultStore::new()))
            }
        }
    }

    pub async fn create_scheduler(&self) -> Result<Arc<HealthScheduler>> {
        let settings = SchedulerSettings {
            performance_sample_interval: self.config.performance_sample_interval(),
            retention_days: self.config.operational.retention_days,
            weekly_report: self
                .config
                .schedule
                .weekly_report
                .then_some(ReportFormat::Json),
        };
        Ok(Arc::new(
            HealthScheduler::new(
                self.orchestrator.clone(),
                Some(self.performance.clone()),
                settings,
            )
            .await?
            .with_reports(self.reports.clone()),
        ))
    }

    pub fn app_state(&self, scheduler: Option<Arc<HealthScheduler>>) -> AppState {
        AppState {
            orchestrator: self.orchestrator.clone(),
            scheduler,
            reports: self.reports.clone(),
            performance: self.performance.clone(),
            traffic: self.traffic.clone(),
        }
    }

    /// Quick liveness check of the result store
    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.store.recent(1).await.is_ok())
    }
}
