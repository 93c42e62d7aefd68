use super::probes::panic_message;
use super::HealthStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    /// Severity of a transition into `status`.
    pub fn for_status(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => AlertSeverity::Info,
            HealthStatus::Degraded => AlertSeverity::Warning,
            HealthStatus::Unhealthy => AlertSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    StatusChanged {
        previous: Option<HealthStatus>,
        current: HealthStatus,
        score: u8,
    },
    RemediationSucceeded {
        rule_id: String,
    },
    RemediationFailed {
        rule_id: String,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub module: String,
    pub severity: AlertSeverity,
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Notification {
    pub fn status_changed(
        module: &str,
        previous: Option<HealthStatus>,
        current: HealthStatus,
        score: u8,
    ) -> Self {
        let message = match previous {
            Some(previous) => format!("{module} changed from {previous} to {current} (score {score})"),
            None => format!("{module} reported {current} (score {score})"),
        };
        Self {
            module: module.to_string(),
            severity: AlertSeverity::for_status(current),
            kind: NotificationKind::StatusChanged {
                previous,
                current,
                score,
            },
            message,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn remediation(module: &str, rule_id: &str, success: bool, error: Option<String>) -> Self {
        let (severity, kind, message) = if success {
            (
                AlertSeverity::Info,
                NotificationKind::RemediationSucceeded {
                    rule_id: rule_id.to_string(),
                },
                format!("Remediation rule {rule_id} succeeded for {module}"),
            )
        } else {
            (
                AlertSeverity::Critical,
                NotificationKind::RemediationFailed {
                    rule_id: rule_id.to_string(),
                    error: error.clone(),
                },
                format!(
                    "Remediation rule {rule_id} failed for {module}: {}",
                    error.as_deref().unwrap_or("unknown error")
                ),
            )
        };
        Self {
            module: module.to_string(),
            severity,
            kind,
            message,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Human alerting channel. Delivery is best effort.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log at a level matching their severity.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification.severity {
            AlertSeverity::Critical => {
                error!(module = %notification.module, "CRITICAL: {}", notification.message)
            }
            AlertSeverity::Warning => {
                warn!(module = %notification.module, "WARNING: {}", notification.message)
            }
            AlertSeverity::Info => {
                info!(module = %notification.module, "{}", notification.message)
            }
        }
        Ok(())
    }
}

/// Best-effort delivery: waits at most `timeout` and never fails or
/// unwinds into the caller.
pub async fn deliver(sink: &Arc<dyn NotificationSink>, notification: Notification, timeout: Duration) {
    let send = AssertUnwindSafe(sink.send(&notification)).catch_unwind();
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(module = %notification.module, "Notification delivery failed: {e:#}"),
        Ok(Err(panic)) => warn!(
            module = %notification.module,
            "Notification sink panicked: {}",
            panic_message(panic.as_ref())
        ),
        Err(_) => warn!(module = %notification.module, "Notification delivery timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct BrokenSink;

    #[async_trait]
    impl NotificationSink for BrokenSink {
        async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    #[test]
    fn status_change_severity_follows_new_status() {
        let n = Notification::status_changed(
            "queue",
            Some(HealthStatus::Healthy),
            HealthStatus::Unhealthy,
            30,
        );
        assert_eq!(n.severity, AlertSeverity::Critical);
        assert!(n.message.contains("HEALTHY to UNHEALTHY"));
    }

    struct PanickingSink;

    #[async_trait]
    impl NotificationSink for PanickingSink {
        async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
            panic!("webhook client poisoned")
        }
    }

    #[tokio::test]
    async fn failing_sink_is_swallowed() {
        let sink: Arc<dyn NotificationSink> = Arc::new(BrokenSink);
        let n = Notification::remediation("queue", "restart", false, Some("exit 1".into()));
        deliver(&sink, n, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn panicking_sink_does_not_unwind_into_caller() {
        let sink: Arc<dyn NotificationSink> = Arc::new(PanickingSink);
        let n = Notification::status_changed("queue", None, HealthStatus::Degraded, 70);
        deliver(&sink, n, Duration::from_secs(1)).await;
        assert!(logs_contain("webhook client poisoned"));
    }

    #[test]
    fn metadata_is_attached() {
        let n = Notification::remediation("queue", "restart", true, None)
            .with_metadata("score_before", 30)
            .with_metadata("trigger", "manual");
        assert_eq!(n.metadata.get("score_before").map(String::as_str), Some("30"));
        assert_eq!(n.metadata.len(), 2);
    }
}
