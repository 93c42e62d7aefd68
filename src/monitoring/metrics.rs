use super::remediation::RemediationLog;
use super::{ModuleCheckResult, PerformanceSample};
use prometheus::{
    exponential_buckets, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry,
};
use std::sync::Arc;
use tracing::error;

/// Prometheus self-observation for the orchestrator
pub struct HealthMetrics {
    registry: Arc<Registry>,

    // Run metrics
    pub runs_total: IntCounterVec,
    pub runs_failed_total: IntCounter,
    pub runs_rejected_total: IntCounter,

    // Probe metrics
    pub probe_failures_total: IntCounterVec,
    pub probe_duration_seconds: HistogramVec,
    pub module_score: GaugeVec,

    // Remediation metrics
    pub remediation_attempts_total: IntCounterVec,
    pub remediation_skipped_total: IntCounterVec,

    // System metrics
    pub cpu_usage_percent: Gauge,
    pub memory_usage_percent: Gauge,
    pub api_error_rate_percent: Gauge,
}

impl HealthMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let runs_total = IntCounterVec::new(
            Opts::new("health_check_runs_total", "Completed orchestrated runs"),
            &["trigger"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let runs_failed_total = IntCounter::with_opts(Opts::new(
            "health_check_runs_failed_total",
            "Runs that could not complete because of a system failure",
        ))?;
        registry.register(Box::new(runs_failed_total.clone()))?;

        let runs_rejected_total = IntCounter::with_opts(Opts::new(
            "health_check_runs_rejected_total",
            "Run requests refused because another run was in flight",
        ))?;
        registry.register(Box::new(runs_rejected_total.clone()))?;

        let probe_failures_total = IntCounterVec::new(
            Opts::new(
                "health_check_probe_failures_total",
                "Probes that errored, panicked or timed out",
            ),
            &["module", "kind"],
        )?;
        registry.register(Box::new(probe_failures_total.clone()))?;

        let probe_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "health_check_probe_duration_seconds",
                "Wall-clock duration of probe calls",
            )
            .buckets(exponential_buckets(0.005, 2.0, 14)?),
            &["module"],
        )?;
        registry.register(Box::new(probe_duration_seconds.clone()))?;

        let module_score = GaugeVec::new(
            Opts::new("health_check_module_score", "Latest score per module"),
            &["module"],
        )?;
        registry.register(Box::new(module_score.clone()))?;

        let remediation_attempts_total = IntCounterVec::new(
            Opts::new(
                "health_check_remediation_attempts_total",
                "Remediation attempts by outcome",
            ),
            &["module", "outcome"],
        )?;
        registry.register(Box::new(remediation_attempts_total.clone()))?;

        let remediation_skipped_total = IntCounterVec::new(
            Opts::new(
                "health_check_remediation_skipped_total",
                "Remediation attempts skipped by a safeguard",
            ),
            &["module", "reason"],
        )?;
        registry.register(Box::new(remediation_skipped_total.clone()))?;

        let cpu_usage_percent = Gauge::with_opts(Opts::new(
            "health_check_cpu_usage_percent",
            "Host CPU usage from the last performance sample",
        ))?;
        registry.register(Box::new(cpu_usage_percent.clone()))?;

        let memory_usage_percent = Gauge::with_opts(Opts::new(
            "health_check_memory_usage_percent",
            "Host memory usage from the last performance sample",
        ))?;
        registry.register(Box::new(memory_usage_percent.clone()))?;

        let api_error_rate_percent = Gauge::with_opts(Opts::new(
            "health_check_api_error_rate_percent",
            "API error rate over the last minute",
        ))?;
        registry.register(Box::new(api_error_rate_percent.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            runs_failed_total,
            runs_rejected_total,
            probe_failures_total,
            probe_duration_seconds,
            module_score,
            remediation_attempts_total,
            remediation_skipped_total,
            cpu_usage_percent,
            memory_usage_percent,
            api_error_rate_percent,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_result(&self, result: &ModuleCheckResult, failure_kind: Option<&str>) {
        self.module_score
            .with_label_values(&[result.module.as_str()])
            .set(result.score as f64);
        self.probe_duration_seconds
            .with_label_values(&[result.module.as_str()])
            .observe(result.execution_time_ms as f64 / 1000.0);
        if let Some(kind) = failure_kind {
            self.probe_failures_total
                .with_label_values(&[result.module.as_str(), kind])
                .inc();
        }
    }

    pub fn record_remediation(&self, log: &RemediationLog) {
        if log.skipped {
            let reason = log.skip_reason.as_deref().unwrap_or("unknown");
            self.remediation_skipped_total
                .with_label_values(&[log.module.as_str(), reason])
                .inc();
        } else {
            let outcome = if log.success { "success" } else { "failure" };
            self.remediation_attempts_total
                .with_label_values(&[log.module.as_str(), outcome])
                .inc();
        }
    }

    pub fn record_sample(&self, sample: &PerformanceSample) {
        self.cpu_usage_percent.set(sample.cpu_usage);
        self.memory_usage_percent.set(sample.memory_usage);
        self.api_error_rate_percent.set(sample.error_rate);
    }

    /// Get metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::HealthStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_result_updates_score_gauge() {
        let metrics = HealthMetrics::new().unwrap();
        let result = ModuleCheckResult {
            sequence: 1,
            module: "queue".into(),
            status: HealthStatus::Unhealthy,
            score: 30,
            checks: vec![],
            warnings: vec![],
            errors: vec![],
            metrics: Default::default(),
            execution_time_ms: 120,
            timestamp: Utc::now(),
        };
        metrics.record_result(&result, Some("probe-timeout"));

        assert_eq!(metrics.module_score.with_label_values(&["queue"]).get(), 30.0);
        assert_eq!(
            metrics
                .probe_failures_total
                .with_label_values(&["queue", "probe-timeout"])
                .get(),
            1
        );
        assert!(metrics.gather_metrics().contains("health_check_module_score"));
    }

    #[test]
    fn test_skipped_remediation_counts_separately() {
        let metrics = HealthMetrics::new().unwrap();
        let log = RemediationLog {
            id: Uuid::new_v4(),
            rule_id: "restart".into(),
            module: "queue".into(),
            success: false,
            skipped: true,
            skip_reason: Some("budget-exhausted".into()),
            actions_executed: vec![],
            error: None,
            health_score_before: 30,
            health_score_after: None,
            timestamp: Utc::now(),
        };
        metrics.record_remediation(&log);
        assert_eq!(
            metrics
                .remediation_skipped_total
                .with_label_values(&["queue", "budget-exhausted"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .remediation_attempts_total
                .with_label_values(&["queue", "failure"])
                .get(),
            0
        );
    }
}
