//! Small JSON documents under `STATE_DIR` that hold operator-editable
//! configuration (remediation rules, schedule).

use crate::error::{HealthError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Reads `path`, or writes `default` there and returns it when the file is
/// missing.
pub(crate) async fn load_or_create<T>(path: &Path, default: T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    if !tokio::fs::try_exists(path).await? {
        info!("State file not found, creating default: {}", path.display());
        save(path, &default).await?;
        return Ok(default);
    }

    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        HealthError::Configuration(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        HealthError::Configuration(format!("Invalid JSON in {}: {}", path.display(), e))
    })
}

pub(crate) async fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let content = serde_json::to_string_pretty(value)?;
    // Write-then-rename so a crash never leaves a truncated document.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
