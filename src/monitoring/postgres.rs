use super::remediation::RemediationLog;
use super::store::{PruneReport, RemediationLogFilter, ResultStore};
use super::{CheckOutcome, HealthStatus, ModuleCheckResult, PerformanceSample};
use crate::error::{HealthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE SEQUENCE IF NOT EXISTS health_record_seq",
    r#"CREATE TABLE IF NOT EXISTS health_check_results (
        sequence BIGINT PRIMARY KEY DEFAULT nextval('health_record_seq'),
        module TEXT NOT NULL,
        status TEXT NOT NULL,
        score SMALLINT NOT NULL,
        checks JSONB NOT NULL,
        warnings JSONB NOT NULL,
        errors JSONB NOT NULL,
        metrics JSONB NOT NULL,
        execution_time_ms BIGINT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_health_results_module_time ON health_check_results (module, timestamp DESC, sequence DESC)",
    "CREATE INDEX IF NOT EXISTS idx_health_results_time ON health_check_results (timestamp)",
    r#"CREATE TABLE IF NOT EXISTS performance_samples (
        sequence BIGINT PRIMARY KEY DEFAULT nextval('health_record_seq'),
        cpu_usage DOUBLE PRECISION NOT NULL,
        memory_usage DOUBLE PRECISION NOT NULL,
        database_connections INTEGER NOT NULL,
        api_response_time_ms DOUBLE PRECISION NOT NULL,
        requests_per_minute DOUBLE PRECISION NOT NULL,
        error_rate DOUBLE PRECISION NOT NULL,
        metrics JSONB NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_performance_time ON performance_samples (timestamp)",
    r#"CREATE TABLE IF NOT EXISTS remediation_logs (
        sequence BIGINT PRIMARY KEY DEFAULT nextval('health_record_seq'),
        id UUID NOT NULL UNIQUE,
        rule_id TEXT NOT NULL,
        module TEXT NOT NULL,
        success BOOLEAN NOT NULL,
        skipped BOOLEAN NOT NULL DEFAULT FALSE,
        skip_reason TEXT,
        actions_executed JSONB NOT NULL,
        error TEXT,
        health_score_before SMALLINT NOT NULL,
        health_score_after SMALLINT,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_remediation_rule_time ON remediation_logs (rule_id, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_remediation_module_time ON remediation_logs (module, timestamp DESC)",
];

const RESULT_COLUMNS: &str = "sequence, module, status, score, checks, warnings, errors, metrics, execution_time_ms, timestamp";
const SAMPLE_COLUMNS: &str = "sequence, cpu_usage, memory_usage, database_connections, api_response_time_ms, requests_per_minute, error_rate, metrics, timestamp";
const LOG_COLUMNS: &str = "id, rule_id, module, success, skipped, skip_reason, actions_executed, error, health_score_before, health_score_after, timestamp";

/// PostgreSQL-backed result history. Sequence numbers come from one shared
/// database sequence so ordering holds across processes.
#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to result store database");
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Result store schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn result_from_row(row: &PgRow) -> Result<ModuleCheckResult> {
    let status: String = row.try_get("status")?;
    let score: i16 = row.try_get("score")?;
    let execution_time_ms: i64 = row.try_get("execution_time_ms")?;
    let Json(checks): Json<Vec<CheckOutcome>> = row.try_get("checks")?;
    let Json(warnings): Json<Vec<String>> = row.try_get("warnings")?;
    let Json(errors): Json<Vec<String>> = row.try_get("errors")?;
    let Json(metrics): Json<HashMap<String, serde_json::Value>> = row.try_get("metrics")?;
    Ok(ModuleCheckResult {
        sequence: row.try_get("sequence")?,
        module: row.try_get("module")?,
        status: status
            .parse::<HealthStatus>()
            .map_err(|e| HealthError::store(format!("corrupt status column: {e}")))?,
        score: score.clamp(0, 100) as u8,
        checks,
        warnings,
        errors,
        metrics,
        execution_time_ms: execution_time_ms.max(0) as u64,
        timestamp: row.try_get("timestamp")?,
    })
}

fn sample_from_row(row: &PgRow) -> Result<PerformanceSample> {
    let database_connections: i32 = row.try_get("database_connections")?;
    let Json(metrics): Json<HashMap<String, serde_json::Value>> = row.try_get("metrics")?;
    Ok(PerformanceSample {
        sequence: row.try_get("sequence")?,
        cpu_usage: row.try_get("cpu_usage")?,
        memory_usage: row.try_get("memory_usage")?,
        database_connections: database_connections.max(0) as u32,
        api_response_time_ms: row.try_get("api_response_time_ms")?,
        requests_per_minute: row.try_get("requests_per_minute")?,
        error_rate: row.try_get("error_rate")?,
        metrics,
        timestamp: row.try_get("timestamp")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<RemediationLog> {
    let before: i16 = row.try_get("health_score_before")?;
    let after: Option<i16> = row.try_get("health_score_after")?;
    let Json(actions_executed): Json<Vec<String>> = row.try_get("actions_executed")?;
    Ok(RemediationLog {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        module: row.try_get("module")?,
        success: row.try_get("success")?,
        skipped: row.try_get("skipped")?,
        skip_reason: row.try_get("skip_reason")?,
        actions_executed,
        error: row.try_get("error")?,
        health_score_before: before.clamp(0, 100) as u8,
        health_score_after: after.map(|s| s.clamp(0, 100) as u8),
        timestamp: row.try_get("timestamp")?,
    })
}

fn limit_param(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    async fn save(&self, mut result: ModuleCheckResult) -> Result<ModuleCheckResult> {
        let row = sqlx::query(
            r#"INSERT INTO health_check_results
                (module, status, score, checks, warnings, errors, metrics, execution_time_ms, timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING sequence"#,
        )
        .bind(&result.module)
        .bind(result.status.as_str())
        .bind(result.score as i16)
        .bind(Json(&result.checks))
        .bind(Json(&result.warnings))
        .bind(Json(&result.errors))
        .bind(Json(&result.metrics))
        .bind(result.execution_time_ms.min(i64::MAX as u64) as i64)
        .bind(result.timestamp)
        .fetch_one(&self.pool)
        .await?;
        result.sequence = row.try_get("sequence")?;
        Ok(result)
    }

    async fn save_performance(&self, mut sample: PerformanceSample) -> Result<PerformanceSample> {
        let row = sqlx::query(
            r#"INSERT INTO performance_samples
                (cpu_usage, memory_usage, database_connections, api_response_time_ms,
                 requests_per_minute, error_rate, metrics, timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING sequence"#,
        )
        .bind(sample.cpu_usage)
        .bind(sample.memory_usage)
        .bind(sample.database_connections.min(i32::MAX as u32) as i32)
        .bind(sample.api_response_time_ms)
        .bind(sample.requests_per_minute)
        .bind(sample.error_rate)
        .bind(Json(&sample.metrics))
        .bind(sample.timestamp)
        .fetch_one(&self.pool)
        .await?;
        sample.sequence = row.try_get("sequence")?;
        Ok(sample)
    }

    async fn latest(&self, module: &str) -> Result<Option<ModuleCheckResult>> {
        Ok(self.history(module, 1).await?.into_iter().next())
    }

    async fn history(&self, module: &str, limit: usize) -> Result<Vec<ModuleCheckResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM health_check_results WHERE module = $1 ORDER BY timestamp DESC, sequence DESC LIMIT $2"
        ))
        .bind(module)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ModuleCheckResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM health_check_results ORDER BY timestamp DESC, sequence DESC LIMIT $1"
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn history_in_range(
        &self,
        module: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ModuleCheckResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM health_check_results
             WHERE ($1::TEXT IS NULL OR module = $1) AND timestamp >= $2 AND timestamp <= $3
             ORDER BY timestamp ASC, sequence ASC"
        ))
        .bind(module)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn latest_performance(&self) -> Result<Option<PerformanceSample>> {
        let row = sqlx::query(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM performance_samples ORDER BY timestamp DESC, sequence DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sample_from_row).transpose()
    }

    async fn performance_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSample>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM performance_samples
             WHERE timestamp >= $1 AND timestamp <= $2
             ORDER BY timestamp ASC, sequence ASC"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sample_from_row).collect()
    }

    async fn save_remediation_log(&self, log: RemediationLog) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO remediation_logs
                (id, rule_id, module, success, skipped, skip_reason, actions_executed, error,
                 health_score_before, health_score_after, timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(log.id)
        .bind(&log.rule_id)
        .bind(&log.module)
        .bind(log.success)
        .bind(log.skipped)
        .bind(&log.skip_reason)
        .bind(Json(&log.actions_executed))
        .bind(&log.error)
        .bind(log.health_score_before as i16)
        .bind(log.health_score_after.map(|s| s as i16))
        .bind(log.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remediation_logs(&self, filter: &RemediationLogFilter) -> Result<Vec<RemediationLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM remediation_logs
             WHERE ($1::TEXT IS NULL OR module = $1)
               AND ($2::TEXT IS NULL OR rule_id = $2)
               AND ($3::TIMESTAMPTZ IS NULL OR timestamp >= $3)
               AND ($4::TIMESTAMPTZ IS NULL OR timestamp <= $4)
             ORDER BY timestamp DESC, sequence DESC
             LIMIT $5"
        ))
        .bind(filter.module.as_deref())
        .bind(filter.rule_id.as_deref())
        .bind(filter.start)
        .bind(filter.end)
        .bind(filter.limit.map(limit_param))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn remediation_attempts_since(
        &self,
        rule_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemediationLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM remediation_logs
             WHERE rule_id = $1 AND timestamp >= $2 AND NOT skipped
             ORDER BY timestamp DESC, sequence DESC"
        ))
        .bind(rule_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let mut tx = self.pool.begin().await?;
        let results = sqlx::query("DELETE FROM health_check_results WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let samples = sqlx::query("DELETE FROM performance_samples WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let logs = sqlx::query("DELETE FROM remediation_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(PruneReport {
            results_removed: results.rows_affected(),
            samples_removed: samples.rows_affected(),
            remediation_logs_removed: logs.rows_affected(),
        })
    }

    async fn connection_count(&self) -> u32 {
        self.pool.size()
    }
}
