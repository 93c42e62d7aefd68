//! System-wide performance sampling, independent of module checks.

use super::orchestrator::Orchestrator;
use super::{HealthStatus, PerformanceSample};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;
use tracing::{debug, warn};

const TRAFFIC_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub avg_response_time_ms: f64,
    pub requests_per_minute: f64,
    /// Percentage of requests in the window that failed.
    pub error_rate: f64,
}

/// Rolling one-minute window of API requests, fed by the HTTP middleware.
#[derive(Debug, Default)]
pub struct ApiTrafficStats {
    window: Mutex<VecDeque<(Instant, Duration, bool)>>,
}

impl ApiTrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration, is_error: bool) {
        let now = Instant::now();
        if let Ok(mut window) = self.window.lock() {
            window.push_back((now, elapsed, is_error));
            Self::evict(&mut window, now);
        }
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let now = Instant::now();
        let Ok(mut window) = self.window.lock() else {
            return TrafficSnapshot::default();
        };
        Self::evict(&mut window, now);
        if window.is_empty() {
            return TrafficSnapshot::default();
        }
        let count = window.len() as f64;
        let total_ms: f64 = window.iter().map(|(_, d, _)| d.as_secs_f64() * 1000.0).sum();
        let errors = window.iter().filter(|(_, _, e)| *e).count() as f64;
        TrafficSnapshot {
            avg_response_time_ms: total_ms / count,
            requests_per_minute: count,
            error_rate: errors / count * 100.0,
        }
    }

    fn evict(window: &mut VecDeque<(Instant, Duration, bool)>, now: Instant) {
        while let Some((at, _, _)) = window.front() {
            if now.duration_since(*at) > TRAFFIC_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub response_time_ms: f64,
    pub error_rate_percent: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
            response_time_ms: 1000.0,
            error_rate_percent: 5.0,
        }
    }
}

impl PerformanceThresholds {
    /// Human-readable description of every threshold the sample exceeds.
    pub fn breaches(&self, sample: &PerformanceSample) -> Vec<String> {
        let mut breaches = Vec::new();
        if sample.cpu_usage > self.cpu_percent {
            breaches.push(format!(
                "High CPU usage: {:.1}% (threshold: {:.1}%)",
                sample.cpu_usage, self.cpu_percent
            ));
        }
        if sample.memory_usage > self.memory_percent {
            breaches.push(format!(
                "High memory usage: {:.1}% (threshold: {:.1}%)",
                sample.memory_usage, self.memory_percent
            ));
        }
        if sample.api_response_time_ms > self.response_time_ms {
            breaches.push(format!(
                "Slow API responses: {:.0}ms (threshold: {:.0}ms)",
                sample.api_response_time_ms, self.response_time_ms
            ));
        }
        if sample.error_rate > self.error_rate_percent {
            breaches.push(format!(
                "High API error rate: {:.1}% (threshold: {:.1}%)",
                sample.error_rate, self.error_rate_percent
            ));
        }
        breaches
    }
}

pub struct PerformanceMonitor {
    orchestrator: Arc<Orchestrator>,
    traffic: Arc<ApiTrafficStats>,
    thresholds: PerformanceThresholds,
    system: Mutex<System>,
    started: Instant,
}

impl PerformanceMonitor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        traffic: Arc<ApiTrafficStats>,
        thresholds: PerformanceThresholds,
    ) -> Self {
        Self {
            orchestrator,
            traffic,
            thresholds,
            system: Mutex::new(System::new()),
            started: Instant::now(),
        }
    }

    pub fn traffic(&self) -> Arc<ApiTrafficStats> {
        self.traffic.clone()
    }

    /// Takes a live sample without persisting it.
    pub async fn collect(&self) -> Result<PerformanceSample> {
        let (cpu_usage, memory_usage) = self.host_usage();
        let traffic = self.traffic.snapshot();
        let database_connections = self.orchestrator.store().connection_count().await;

        let mut metrics = HashMap::new();
        metrics.insert(
            "uptime_seconds".to_string(),
            serde_json::json!(self.started.elapsed().as_secs()),
        );
        metrics.insert(
            "run_in_progress".to_string(),
            serde_json::json!(self.orchestrator.is_running()),
        );
        let summary = self.orchestrator.summary().await?;
        let latest: Vec<_> = summary.modules.iter().filter_map(|m| m.latest.as_ref()).collect();
        metrics.insert(
            "modules_registered".to_string(),
            serde_json::json!(summary.modules.len()),
        );
        metrics.insert(
            "modules_unhealthy".to_string(),
            serde_json::json!(latest
                .iter()
                .filter(|r| r.status == HealthStatus::Unhealthy)
                .count()),
        );
        if !latest.is_empty() {
            let avg_probe_ms =
                latest.iter().map(|r| r.execution_time_ms as f64).sum::<f64>() / latest.len() as f64;
            metrics.insert("avg_probe_time_ms".to_string(), serde_json::json!(avg_probe_ms));
        }

        Ok(PerformanceSample {
            sequence: 0,
            cpu_usage,
            memory_usage,
            database_connections,
            api_response_time_ms: traffic.avg_response_time_ms,
            requests_per_minute: traffic.requests_per_minute,
            error_rate: traffic.error_rate,
            metrics,
            timestamp: Utc::now(),
        })
    }

    /// Collects, persists and checks one sample against the thresholds.
    pub async fn sample_and_store(&self) -> Result<PerformanceSample> {
        let sample = self.collect().await?;
        let sample = self.orchestrator.store().save_performance(sample).await?;
        self.orchestrator.metrics().record_sample(&sample);

        for breach in self.thresholds.breaches(&sample) {
            warn!("{}", breach);
        }
        debug!(
            cpu = sample.cpu_usage,
            memory = sample.memory_usage,
            rpm = sample.requests_per_minute,
            "Performance sample stored"
        );
        Ok(sample)
    }

    pub async fn history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSample>> {
        self.orchestrator.store().performance_in_range(start, end).await
    }

    /// CPU and memory usage in percent. CPU usage is measured between
    /// successive calls, so the first reading is zero.
    fn host_usage(&self) -> (f64, f64) {
        let Ok(mut sys) = self.system.lock() else {
            return (0.0, 0.0);
        };
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu = sys.global_cpu_info().cpu_usage() as f64;
        let total = sys.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / total as f64 * 100.0
        };
        (cpu, memory)
    }
}
