//! Append-only history of module results, performance samples and
//! remediation attempts.

use super::remediation::RemediationLog;
use super::{ModuleCheckResult, PerformanceSample};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationLogFilter {
    pub module: Option<String>,
    pub rule_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RemediationLogFilter {
    pub fn matches(&self, log: &RemediationLog) -> bool {
        if let Some(module) = &self.module {
            if &log.module != module {
                return false;
            }
        }
        if let Some(rule_id) = &self.rule_id {
            if &log.rule_id != rule_id {
                return false;
            }
        }
        if let Some(start) = self.start {
            if log.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if log.timestamp > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub results_removed: u64,
    pub samples_removed: u64,
    pub remediation_logs_removed: u64,
}

/// Durable result history.
///
/// Every write is assigned a store-wide, strictly increasing sequence number;
/// reads that return "newest first" order by `(timestamp, sequence)`
/// descending so same-millisecond results stay totally ordered.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, result: ModuleCheckResult) -> Result<ModuleCheckResult>;

    async fn save_performance(&self, sample: PerformanceSample) -> Result<PerformanceSample>;

    async fn latest(&self, module: &str) -> Result<Option<ModuleCheckResult>>;

    /// Last `limit` results for `module`, newest first.
    async fn history(&self, module: &str, limit: usize) -> Result<Vec<ModuleCheckResult>>;

    /// Last `limit` results across all modules, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ModuleCheckResult>>;

    /// Results with `start <= timestamp <= end`, oldest first.
    async fn history_in_range(
        &self,
        module: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ModuleCheckResult>>;

    async fn latest_performance(&self) -> Result<Option<PerformanceSample>>;

    /// Samples with `start <= timestamp <= end`, oldest first.
    async fn performance_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSample>>;

    async fn save_remediation_log(&self, log: RemediationLog) -> Result<()>;

    /// Matching remediation logs, newest first.
    async fn remediation_logs(&self, filter: &RemediationLogFilter) -> Result<Vec<RemediationLog>>;

    /// Attempts (non-skipped entries) of one rule since `since`, newest first.
    async fn remediation_attempts_since(
        &self,
        rule_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemediationLog>>;

    /// Maintenance only: drop everything older than `cutoff`.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport>;

    /// Open connections held by the backing store, if any.
    async fn connection_count(&self) -> u32 {
        0
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_sequence: i64,
    results: Vec<ModuleCheckResult>,
    samples: Vec<PerformanceSample>,
    remediation_logs: Vec<(i64, RemediationLog)>,
}

impl MemoryState {
    fn next(&mut self) -> i64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    state: RwLock<MemoryState>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(results: &mut [ModuleCheckResult]) {
    results.sort_by_key(|r| Reverse((r.timestamp, r.sequence)));
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save(&self, mut result: ModuleCheckResult) -> Result<ModuleCheckResult> {
        let mut state = self.state.write().await;
        result.sequence = state.next();
        state.results.push(result.clone());
        Ok(result)
    }

    async fn save_performance(&self, mut sample: PerformanceSample) -> Result<PerformanceSample> {
        let mut state = self.state.write().await;
        sample.sequence = state.next();
        state.samples.push(sample.clone());
        Ok(sample)
    }

    async fn latest(&self, module: &str) -> Result<Option<ModuleCheckResult>> {
        Ok(self.history(module, 1).await?.into_iter().next())
    }

    async fn history(&self, module: &str, limit: usize) -> Result<Vec<ModuleCheckResult>> {
        let state = self.state.read().await;
        let mut results: Vec<_> = state
            .results
            .iter()
            .filter(|r| r.module == module)
            .cloned()
            .collect();
        newest_first(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ModuleCheckResult>> {
        let state = self.state.read().await;
        let mut results = state.results.clone();
        newest_first(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn history_in_range(
        &self,
        module: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ModuleCheckResult>> {
        let state = self.state.read().await;
        let mut results: Vec<_> = state
            .results
            .iter()
            .filter(|r| module.map_or(true, |m| r.module == m))
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        results.sort_by_key(|r| (r.timestamp, r.sequence));
        Ok(results)
    }

    async fn latest_performance(&self) -> Result<Option<PerformanceSample>> {
        let state = self.state.read().await;
        Ok(state
            .samples
            .iter()
            .max_by_key(|s| (s.timestamp, s.sequence))
            .cloned())
    }

    async fn performance_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerformanceSample>> {
        let state = self.state.read().await;
        let mut samples: Vec<_> = state
            .samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();
        samples.sort_by_key(|s| (s.timestamp, s.sequence));
        Ok(samples)
    }

    async fn save_remediation_log(&self, log: RemediationLog) -> Result<()> {
        let mut state = self.state.write().await;
        let sequence = state.next();
        state.remediation_logs.push((sequence, log));
        Ok(())
    }

    async fn remediation_logs(&self, filter: &RemediationLogFilter) -> Result<Vec<RemediationLog>> {
        let state = self.state.read().await;
        let mut logs: Vec<_> = state
            .remediation_logs
            .iter()
            .filter(|(_, log)| filter.matches(log))
            .cloned()
            .collect();
        logs.sort_by_key(|(sequence, log)| Reverse((log.timestamp, *sequence)));
        let mut logs: Vec<_> = logs.into_iter().map(|(_, log)| log).collect();
        if let Some(limit) = filter.limit {
            logs.truncate(limit);
        }
        Ok(logs)
    }

    async fn remediation_attempts_since(
        &self,
        rule_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemediationLog>> {
        let filter = RemediationLogFilter {
            rule_id: Some(rule_id.to_string()),
            start: Some(since),
            ..Default::default()
        };
        let logs = self.remediation_logs(&filter).await?;
        Ok(logs.into_iter().filter(|log| !log.skipped).collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let mut state = self.state.write().await;
        let before = (
            state.results.len(),
            state.samples.len(),
            state.remediation_logs.len(),
        );
        state.results.retain(|r| r.timestamp >= cutoff);
        state.samples.retain(|s| s.timestamp >= cutoff);
        state.remediation_logs.retain(|(_, l)| l.timestamp >= cutoff);
        Ok(PruneReport {
            results_removed: (before.0 - state.results.len()) as u64,
            samples_removed: (before.1 - state.samples.len()) as u64,
            remediation_logs_removed: (before.2 - state.remediation_logs.len()) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{CheckOutcome, HealthStatus};
    use chrono::Duration;
    use std::collections::HashSet;

    fn result(module: &str, score: u8, timestamp: DateTime<Utc>) -> ModuleCheckResult {
        ModuleCheckResult {
            sequence: 0,
            module: module.to_string(),
            status: HealthStatus::from_score(score),
            score,
            checks: vec![CheckOutcome::pass("ping")],
            warnings: vec![],
            errors: vec![],
            metrics: Default::default(),
            execution_time_ms: 5,
            timestamp,
        }
    }

    #[tokio::test]
    async fn history_is_newest_first_without_gaps() {
        let store = InMemoryResultStore::new();
        let base = Utc::now();
        for i in 0..10 {
            store
                .save(result("queue", i as u8 * 10, base + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let history = store.history("queue", 4).await.unwrap();
        let scores: Vec<u8> = history.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![90, 80, 70, 60]);

        let sequences: Vec<i64> = history.iter().map(|r| r.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] == w[1] + 1));
    }

    #[tokio::test]
    async fn same_timestamp_results_are_ordered_by_sequence() {
        let store = InMemoryResultStore::new();
        let ts = Utc::now();
        for score in [10, 20, 30] {
            store.save(result("db", score, ts)).await.unwrap();
        }
        let history = store.history("db", 10).await.unwrap();
        assert_eq!(
            history.iter().map(|r| r.score).collect::<Vec<_>>(),
            vec![30, 20, 10]
        );
        let unique: HashSet<i64> = history.iter().map(|r| r.sequence).collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_writers_get_distinct_sequences() {
        let store = std::sync::Arc::new(InMemoryResultStore::new());
        let ts = Utc::now();
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.save(result("chat", i, ts)).await.unwrap() })
            })
            .collect();
        let mut sequences = HashSet::new();
        for handle in handles {
            sequences.insert(handle.await.unwrap().sequence);
        }
        assert_eq!(sequences.len(), 20);
        assert_eq!(store.history("chat", 100).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_chronological() {
        let store = InMemoryResultStore::new();
        let base = Utc::now();
        for i in 0..5 {
            store
                .save(result(if i % 2 == 0 { "a" } else { "b" }, 50, base + Duration::minutes(i)))
                .await
                .unwrap();
        }
        let all = store
            .history_in_range(None, base + Duration::minutes(1), base + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let only_a = store
            .history_in_range(Some("a"), base, base + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 3);
    }

    #[tokio::test]
    async fn prune_removes_only_old_entries() {
        let store = InMemoryResultStore::new();
        let now = Utc::now();
        store.save(result("a", 90, now - Duration::days(40))).await.unwrap();
        store.save(result("a", 90, now)).await.unwrap();
        let report = store.prune_before(now - Duration::days(30)).await.unwrap();
        assert_eq!(report.results_removed, 1);
        assert_eq!(store.history("a", 10).await.unwrap().len(), 1);
    }
}
