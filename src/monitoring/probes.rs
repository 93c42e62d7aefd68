use super::scoring::{calculate_score, clamp_score};
use super::{CheckOutcome, HealthStatus, ModuleCheckResult, ProbeReport};
use crate::error::{HealthError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Health probe for one module. Supplied by the host application.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> anyhow::Result<ProbeReport>;
}

/// Adapts an async closure into a [`Probe`].
pub struct FnProbe<F> {
    f: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ProbeReport>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ProbeReport>> + Send,
{
    async fn check(&self) -> anyhow::Result<ProbeReport> {
        (self.f)().await
    }
}

/// Module name to probe mapping. Built at startup, read-only afterwards.
#[derive(Default, Clone)]
pub struct ProbeRegistry {
    probes: BTreeMap<String, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: impl Into<String>, probe: Arc<dyn Probe>) -> &mut Self {
        let module = module.into();
        if self.probes.insert(module.clone(), probe).is_some() {
            warn!(module = %module, "Replacing previously registered probe");
        }
        self
    }

    pub fn get(&self, module: &str) -> Result<Arc<dyn Probe>> {
        self.probes
            .get(module)
            .cloned()
            .ok_or_else(|| HealthError::UnknownModule {
                module: module.to_string(),
            })
    }

    pub fn contains(&self, module: &str) -> bool {
        self.probes.contains_key(module)
    }

    /// Registered module names in sorted order.
    pub fn list_modules(&self) -> Vec<String> {
        self.probes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&String, &Arc<dyn Probe>)> {
        self.probes.iter()
    }
}

/// Why a probe produced no report of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout { after_ms: u64 },
    Error(String),
    Panicked(String),
}

impl ProbeFailure {
    pub fn check_name(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout { .. } => "probe-timeout",
            ProbeFailure::Error(_) => "probe-error",
            ProbeFailure::Panicked(_) => "probe-panic",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProbeFailure::Timeout { after_ms } => format!("Probe timed out after {after_ms}ms"),
            ProbeFailure::Error(reason) => format!("Probe failed: {reason}"),
            ProbeFailure::Panicked(reason) => format!("Probe panicked: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub result: ModuleCheckResult,
    pub failure: Option<ProbeFailure>,
}

/// Executes one probe under a timeout and scores the report.
#[derive(Debug, Clone)]
pub struct ProbeRunner {
    timeout: Duration,
}

impl ProbeRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, module: &str, probe: &dyn Probe) -> ProbeOutcome {
        let timestamp = Utc::now();
        let started = Instant::now();

        let call = AssertUnwindSafe(probe.check()).catch_unwind();
        let failure = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(report))) => {
                let execution_time_ms = started.elapsed().as_millis() as u64;
                // A self-reported score only stands in for missing checks.
                let score = match report.score {
                    Some(raw) if report.checks.is_empty() => clamp_score(raw),
                    _ => calculate_score(&report.checks, report.errors.len()),
                };
                debug!(module, score, execution_time_ms, "Probe completed");
                return ProbeOutcome {
                    result: ModuleCheckResult {
                        sequence: 0,
                        module: module.to_string(),
                        status: HealthStatus::from_score(score),
                        score,
                        checks: report.checks,
                        warnings: report.warnings,
                        errors: report.errors,
                        metrics: report.metrics,
                        execution_time_ms,
                        timestamp,
                    },
                    failure: None,
                };
            }
            Ok(Ok(Err(e))) => ProbeFailure::Error(format!("{e:#}")),
            Ok(Err(panic)) => ProbeFailure::Panicked(panic_message(panic.as_ref())),
            Err(_) => ProbeFailure::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            },
        };

        let message = failure.message();
        warn!(module, check = failure.check_name(), "{}", message);
        ProbeOutcome {
            result: ModuleCheckResult {
                sequence: 0,
                module: module.to_string(),
                status: HealthStatus::Unhealthy,
                score: 0,
                checks: vec![CheckOutcome::fail(failure.check_name(), message.clone())],
                warnings: Vec::new(),
                errors: vec![message],
                metrics: Default::default(),
                execution_time_ms: started.elapsed().as_millis() as u64,
                timestamp,
            },
            failure: Some(failure),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(passed: usize, total: usize) -> Arc<dyn Probe> {
        Arc::new(FnProbe::new(move || async move {
            let checks = (0..total)
                .map(|i| {
                    if i < passed {
                        CheckOutcome::pass(format!("c{i}"))
                    } else {
                        CheckOutcome::fail(format!("c{i}"), "down")
                    }
                })
                .collect();
            Ok(ProbeReport::with_checks(checks))
        }))
    }

    #[test]
    fn registry_lists_sorted_modules_and_rejects_unknown() {
        let mut registry = ProbeRegistry::new();
        registry
            .register("queue", fixed(1, 1))
            .register("auth-system", fixed(1, 1));
        assert_eq!(registry.list_modules(), vec!["auth-system", "queue"]);
        assert!(matches!(
            registry.get("payments"),
            Err(HealthError::UnknownModule { .. })
        ));
    }

    #[tokio::test]
    async fn runner_scores_a_report() {
        let runner = ProbeRunner::new(Duration::from_secs(5));
        let outcome = runner.run("queue", fixed(3, 10).as_ref()).await;
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.result.score, 30);
        assert_eq!(outcome.result.status, HealthStatus::Unhealthy);
        assert_eq!(outcome.result.module, "queue");
    }

    #[tokio::test]
    async fn probe_error_becomes_unhealthy_result() {
        let probe =
            FnProbe::new(|| async { Err::<ProbeReport, _>(anyhow::anyhow!("connection refused")) });
        let runner = ProbeRunner::new(Duration::from_secs(5));
        let outcome = runner.run("database-health", &probe).await;
        assert_eq!(outcome.result.status, HealthStatus::Unhealthy);
        assert_eq!(outcome.result.score, 0);
        assert_eq!(outcome.result.checks[0].name, "probe-error");
        assert!(!outcome.result.checks[0].passed);
        assert!(outcome.result.errors[0].contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let probe = FnProbe::new(|| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(ProbeReport::default())
        });
        let runner = ProbeRunner::new(Duration::from_secs(2));
        let outcome = runner.run("backup-system", &probe).await;
        assert_eq!(outcome.failure, Some(ProbeFailure::Timeout { after_ms: 2000 }));
        assert_eq!(outcome.result.checks[0].name, "probe-timeout");
        assert_eq!(outcome.result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn panicking_probe_is_contained() {
        let probe = FnProbe::new(|| async {
            if true {
                panic!("probe exploded");
            }
            Ok(ProbeReport::default())
        });
        let runner = ProbeRunner::new(Duration::from_secs(5));
        let outcome = runner.run("ai-system", &probe).await;
        assert!(matches!(outcome.failure, Some(ProbeFailure::Panicked(ref m)) if m.contains("exploded")));
        assert_eq!(outcome.result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn self_reported_score_is_clamped() {
        let probe = FnProbe::new(|| async {
            Ok(ProbeReport {
                score: Some(180),
                ..Default::default()
            })
        });
        let runner = ProbeRunner::new(Duration::from_secs(5));
        let outcome = runner.run("chat-system", &probe).await;
        assert_eq!(outcome.result.score, 100);
        assert_eq!(outcome.result.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn checks_take_precedence_over_self_reported_score() {
        let probe = FnProbe::new(|| async {
            let checks = (0..10)
                .map(|i| {
                    if i < 3 {
                        CheckOutcome::pass(format!("c{i}"))
                    } else {
                        CheckOutcome::fail(format!("c{i}"), "down")
                    }
                })
                .collect();
            Ok(ProbeReport {
                score: Some(95),
                ..ProbeReport::with_checks(checks)
            })
        });
        let runner = ProbeRunner::new(Duration::from_secs(5));
        let outcome = runner.run("queue", &probe).await;
        assert_eq!(outcome.result.score, 30);
        assert_eq!(outcome.result.status, HealthStatus::Unhealthy);
    }
}
