pub mod api;
pub mod application;
pub mod config;
pub mod error;
pub mod monitoring;

pub use config::Config;
pub use error::{HealthError, Result};

// Re-export the orchestration surface for library users
pub use monitoring::{
    ActionExecutor, HealthScheduler, HealthStatus, HealthSummary, ModuleCheckResult,
    Orchestrator, OrchestratorBuilder, Probe, ProbeRegistry, RemediationRule, ResultStore,
    RunSummary,
};
