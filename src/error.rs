use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result store unavailable: {message}")]
    Store { message: String },

    #[error("Remediation action {action} failed: {reason}")]
    RemediationAction { action: String, reason: String },

    #[error("Unknown module: {module}")]
    UnknownModule { module: String },

    #[error("Remediation rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("A health check run is already in progress")]
    RunInProgress,

    #[error("Report generation failed: {0}")]
    Report(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl HealthError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// True when the check system itself could not complete, as opposed to a
    /// request that was rejected.
    pub fn is_system_failure(&self) -> bool {
        matches!(
            self,
            HealthError::Database(_)
                | HealthError::Store { .. }
                | HealthError::Report(_)
                | HealthError::Serialization(_)
                | HealthError::Csv(_)
                | HealthError::Io(_)
                | HealthError::Scheduler(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HealthError>;
