use crate::api::create_api_router;
use crate::application::{ApplicationLifecycle, DependencyContainer};
use crate::monitoring::{resolve_period, ReportFormat};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub struct ServerCommandHandler {
    container: Arc<DependencyContainer>,
}

impl ServerCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Serves the HTTP API and drives periodic runs until a shutdown signal.
    pub async fn serve(&self) -> Result<()> {
        let scheduler = self.container.create_scheduler().await?;
        scheduler.start().await?;
        if self.container.config.schedule.initial_check {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                // Failures are logged by the scheduler.
                let _ = scheduler.run_initial_check().await;
            });
        }

        let app = create_api_router(self.container.app_state(Some(scheduler.clone())));
        let addr = format!("0.0.0.0:{}", self.container.config.http_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("HTTP API listening on {}", addr);

        let lifecycle = ApplicationLifecycle::new(self.container.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { lifecycle.wait_for_shutdown().await })
            .await?;

        if let Err(e) = scheduler.shutdown().await {
            warn!("Scheduler did not shut down cleanly: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}

pub struct CheckCommandHandler {
    container: Arc<DependencyContainer>,
}

impl CheckCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// One manual run; prints the run summary as JSON.
    pub async fn run_check(&self, module: Option<String>) -> Result<()> {
        let summary = match self.container.orchestrator.run_manual(module.as_deref()).await {
            Ok(summary) => summary,
            Err(e) if e.is_system_failure() => {
                error!("The health check system could not complete: {}", e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(overall) = summary.overall {
            info!(
                overall = %overall,
                score = ?summary.overall_score,
                modules = summary.results.len(),
                "Health check run finished"
            );
        }
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }
}

pub struct ReportCommandHandler {
    container: Arc<DependencyContainer>,
}

impl ReportCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn generate(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        format: ReportFormat,
    ) -> Result<()> {
        let (from, to) = resolve_period(from, to, Utc::now());
        let report = self.container.reports.generate(from, to, format).await?;
        info!(
            path = %report.path.display(),
            results = report.stats.total,
            "Report written"
        );
        println!("{}", report.path.display());
        Ok(())
    }
}

pub struct ModulesCommandHandler {
    container: Arc<DependencyContainer>,
}

impl ModulesCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub fn list_modules(&self) -> Result<()> {
        let modules = self.container.orchestrator.registry().list_modules();
        if modules.is_empty() {
            warn!("No modules registered");
        }
        for module in modules {
            println!("{module}");
        }
        Ok(())
    }
}
