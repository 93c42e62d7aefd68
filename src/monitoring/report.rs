//! Ranged health reports built from stored history.
//!
//! The generator holds no state of its own: statistics are a pure function
//! of the results in the requested period (plus the preceding period of the
//! same length, for trends), and rendering is a pure function of those.

use super::store::ResultStore;
use super::{HealthStatus, ModuleCheckResult};
use crate::error::{HealthError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

/// Average-score change (in points) needed before a trend is reported.
const TREND_TOLERANCE: f64 = 5.0;

/// Length of the period covered when no dates are given.
pub const DEFAULT_REPORT_DAYS: i64 = 7;

/// Fills missing bounds: `end` defaults to `now`, `start` to
/// [`DEFAULT_REPORT_DAYS`] before `end`.
pub fn resolve_period(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = end.unwrap_or(now);
    let start = start.unwrap_or(end - Duration::days(DEFAULT_REPORT_DAYS));
    (start, end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Csv,
    #[serde(alias = "txt")]
    Text,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
            ReportFormat::Text => "txt",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "text" | "txt" => Ok(ReportFormat::Text),
            other => Err(HealthError::Validation(format!(
                "unsupported report format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl StatusCounts {
    fn add(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Unhealthy => self.unhealthy += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReportStats {
    pub module: String,
    pub checks: usize,
    pub average_score: f64,
    pub min_score: u8,
    pub max_score: u8,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Share of HEALTHY results, in percent.
    pub uptime_percent: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStats {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub count_by_status: StatusCounts,
    pub average_response_time_ms: f64,
    pub average_score: Option<f64>,
    pub modules: Vec<ModuleReportStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedReport {
    pub file_name: String,
    pub path: PathBuf,
    pub format: ReportFormat,
    pub size_bytes: u64,
    pub stats: ReportStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFileInfo {
    pub file_name: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn trend(current: f64, previous: Option<f64>) -> Trend {
    match previous {
        Some(previous) if current - previous > TREND_TOLERANCE => Trend::Improving,
        Some(previous) if previous - current > TREND_TOLERANCE => Trend::Degrading,
        _ => Trend::Stable,
    }
}

/// Aggregates `results` for the period; `previous` covers the preceding
/// period of equal length and only feeds the per-module trend.
pub fn compute_stats(
    results: &[ModuleCheckResult],
    previous: &[ModuleCheckResult],
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    generated_at: DateTime<Utc>,
) -> ReportStats {
    let mut count_by_status = StatusCounts::default();
    let mut by_module: BTreeMap<&str, Vec<&ModuleCheckResult>> = BTreeMap::new();
    for result in results {
        count_by_status.add(result.status);
        by_module.entry(result.module.as_str()).or_default().push(result);
    }

    let modules = by_module
        .into_iter()
        .map(|(module, rows)| {
            let average_score = average(rows.iter().map(|r| r.score as f64)).unwrap_or(0.0);
            let previous_avg = average(
                previous
                    .iter()
                    .filter(|r| r.module == module)
                    .map(|r| r.score as f64),
            );
            let healthy = rows
                .iter()
                .filter(|r| r.status == HealthStatus::Healthy)
                .count();
            ModuleReportStats {
                module: module.to_string(),
                checks: rows.len(),
                average_score,
                min_score: rows.iter().map(|r| r.score).min().unwrap_or(0),
                max_score: rows.iter().map(|r| r.score).max().unwrap_or(0),
                degraded: rows
                    .iter()
                    .filter(|r| r.status == HealthStatus::Degraded)
                    .count(),
                unhealthy: rows
                    .iter()
                    .filter(|r| r.status == HealthStatus::Unhealthy)
                    .count(),
                uptime_percent: healthy as f64 / rows.len() as f64 * 100.0,
                trend: trend(average_score, previous_avg),
            }
        })
        .collect();

    ReportStats {
        period_start,
        period_end,
        generated_at,
        total: results.len(),
        count_by_status,
        average_response_time_ms: average(results.iter().map(|r| r.execution_time_ms as f64))
            .unwrap_or(0.0),
        average_score: average(results.iter().map(|r| r.score as f64)),
        modules,
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    timestamp: String,
    sequence: i64,
    module: &'a str,
    status: &'static str,
    score: u8,
    passed_checks: usize,
    total_checks: usize,
    warnings: usize,
    errors: usize,
    execution_time_ms: u64,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    stats: &'a ReportStats,
    results: &'a [ModuleCheckResult],
}

pub fn render(
    format: ReportFormat,
    stats: &ReportStats,
    results: &[ModuleCheckResult],
) -> Result<Vec<u8>> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_vec_pretty(&JsonReport { stats, results })?),
        ReportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            for r in results {
                writer.serialize(CsvRow {
                    timestamp: r.timestamp.to_rfc3339(),
                    sequence: r.sequence,
                    module: &r.module,
                    status: r.status.as_str(),
                    score: r.score,
                    passed_checks: r.passed_checks(),
                    total_checks: r.checks.len(),
                    warnings: r.warnings.len(),
                    errors: r.errors.len(),
                    execution_time_ms: r.execution_time_ms,
                })?;
            }
            writer
                .into_inner()
                .map_err(|e| HealthError::Report(format!("Failed to flush CSV: {e}")))
        }
        ReportFormat::Text => Ok(render_text(stats).into_bytes()),
    }
}

fn render_text(stats: &ReportStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Health Check Report");
    let _ = writeln!(
        out,
        "Period: {} - {}",
        stats.period_start.to_rfc3339(),
        stats.period_end.to_rfc3339()
    );
    let _ = writeln!(out, "Generated: {}", stats.generated_at.to_rfc3339());
    let _ = writeln!(out);
    let _ = writeln!(out, "Total checks: {}", stats.total);
    let _ = writeln!(
        out,
        "HEALTHY: {}  DEGRADED: {}  UNHEALTHY: {}",
        stats.count_by_status.healthy, stats.count_by_status.degraded, stats.count_by_status.unhealthy
    );
    match stats.average_score {
        Some(score) => {
            let _ = writeln!(out, "Average score: {score:.1}");
        }
        None => {
            let _ = writeln!(out, "Average score: n/a");
        }
    }
    let _ = writeln!(
        out,
        "Average response time: {:.1} ms",
        stats.average_response_time_ms
    );

    if !stats.modules.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<24} {:>6} {:>7} {:>5} {:>5} {:>8}  {}",
            "Module", "Checks", "Avg", "Min", "Max", "Uptime", "Trend"
        );
        for m in &stats.modules {
            let trend = match m.trend {
                Trend::Improving => "improving",
                Trend::Stable => "stable",
                Trend::Degrading => "degrading",
            };
            let _ = writeln!(
                out,
                "{:<24} {:>6} {:>7.1} {:>5} {:>5} {:>7.1}%  {}",
                m.module, m.checks, m.average_score, m.min_score, m.max_score, m.uptime_percent, trend
            );
        }
    }
    out
}

pub struct ReportGenerator {
    store: Arc<dyn ResultStore>,
    reports_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(store: Arc<dyn ResultStore>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            reports_dir: reports_dir.into(),
        }
    }

    pub fn reports_dir(&self) -> &PathBuf {
        &self.reports_dir
    }

    /// Builds the report for `[start, end]` and writes it to the reports
    /// directory.
    #[instrument(skip(self))]
    pub async fn generate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        format: ReportFormat,
    ) -> Result<GeneratedReport> {
        if start >= end {
            return Err(HealthError::Validation(
                "report start must be before its end".to_string(),
            ));
        }

        let results = self.store.history_in_range(None, start, end).await?;
        let previous_start = start - (end - start);
        let previous: Vec<_> = self
            .store
            .history_in_range(None, previous_start, start)
            .await?
            .into_iter()
            .filter(|r| r.timestamp < start)
            .collect();

        let generated_at = Utc::now();
        let stats = compute_stats(&results, &previous, start, end, generated_at);
        let body = render(format, &stats, &results)?;

        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|e| HealthError::Report(format!("Failed to create reports directory: {e}")))?;
        let file_name = format!(
            "health-report-{}-{}-{}.{}",
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
            generated_at.format("%Y%m%dT%H%M%S%3f"),
            format.extension()
        );
        let path = self.reports_dir.join(&file_name);
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| HealthError::Report(format!("Failed to write {}: {e}", path.display())))?;

        info!(
            file = %file_name,
            total = stats.total,
            "Health report generated"
        );
        Ok(GeneratedReport {
            file_name,
            path,
            format,
            size_bytes: body.len() as u64,
            stats,
        })
    }

    /// Report over the last [`DEFAULT_REPORT_DAYS`] days.
    pub async fn generate_default_period(&self, format: ReportFormat) -> Result<GeneratedReport> {
        let (start, end) = resolve_period(None, None, Utc::now());
        self.generate(start, end, format).await
    }

    /// Previously generated reports, newest first.
    pub async fn list_reports(&self) -> Result<Vec<ReportFileInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.reports_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reports = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with("health-report-") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            reports.push(ReportFileInfo {
                file_name,
                size_bytes: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        // Names embed the generation time, so they break ties in mtime.
        reports.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(reports)
    }
}
