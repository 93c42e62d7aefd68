pub mod command;
pub mod metrics;
pub mod notifications;
pub mod orchestrator;
pub mod performance;
pub mod postgres;
pub mod probes;
pub mod remediation;
pub mod report;
pub mod scheduler;
pub mod scoring;
mod state_file;
pub mod store;

pub use command::{CommandActionExecutor, CommandProbe, ProbeCatalog};
pub use metrics::HealthMetrics;
pub use notifications::*;
pub use orchestrator::*;
pub use performance::*;
pub use postgres::PostgresResultStore;
pub use probes::*;
pub use remediation::*;
pub use report::*;
pub use scheduler::*;
pub use scoring::*;
pub use store::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Health tier of a module. Ordered by severity, so `max` is the worst.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
        }
    }

    /// True when `self` is as bad as or worse than `other`.
    pub fn is_at_least(&self, other: HealthStatus) -> bool {
        *self >= other
    }

    pub fn worst<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> Option<HealthStatus> {
        statuses.into_iter().max()
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = crate::HealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HEALTHY" => Ok(HealthStatus::Healthy),
            "DEGRADED" => Ok(HealthStatus::Degraded),
            "UNHEALTHY" => Ok(HealthStatus::Unhealthy),
            other => Err(crate::HealthError::Validation(format!(
                "unknown health status: {other}"
            ))),
        }
    }
}

/// One atomic assertion made by a probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: String,
}

impl CheckOutcome {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: String::new(),
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
        }
    }
}

/// What a probe hands back. The orchestrator fills in module, timing,
/// score and status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub checks: Vec<CheckOutcome>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
    /// Self-computed score, used (clamped to 0..=100) only when `checks` is empty.
    #[serde(default)]
    pub score: Option<i64>,
}

impl ProbeReport {
    pub fn with_checks(checks: Vec<CheckOutcome>) -> Self {
        Self {
            checks,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleCheckResult {
    /// Assigned by the store on save; zero until persisted.
    #[serde(default)]
    pub sequence: i64,
    pub module: String,
    pub status: HealthStatus,
    pub score: u8,
    pub checks: Vec<CheckOutcome>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub metrics: HashMap<String, serde_json::Value>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ModuleCheckResult {
    pub fn passed_checks(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn failed_check(&self, name: &str) -> bool {
        self.checks.iter().any(|c| c.name == name && !c.passed)
    }
}

/// System-wide performance snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSample {
    #[serde(default)]
    pub sequence: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub database_connections: u32,
    pub api_response_time_ms: f64,
    pub requests_per_minute: f64,
    pub error_rate: f64,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Latest state of one module, as shown on the summary page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub module: String,
    pub latest: Option<ModuleCheckResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub overall: Option<HealthStatus>,
    pub overall_score: Option<u8>,
    pub modules: Vec<ModuleSummary>,
    pub automation_enabled: bool,
    pub interval_seconds: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub enabled_rules: usize,
}
