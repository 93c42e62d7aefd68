//! Probes and remediation actions backed by external programs, declared in
//! a TOML catalog.
//!
//! ```toml
//! [[probe]]
//! module = "database-health"
//! command = "/opt/checks/database"
//! args = ["--json"]
//!
//! [[action]]
//! id = "restart-queue"
//! command = "systemctl"
//! args = ["restart", "queue-worker"]
//! ```

use super::probes::{Probe, ProbeRegistry};
use super::remediation::ActionExecutor;
use super::ProbeReport;
use crate::error::{HealthError, Result};
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Environment variable carrying the module name to action programs.
pub const MODULE_ENV: &str = "HEALTH_MODULE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).envs(&self.env).kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeEntry {
    pub module: String,
    #[serde(flatten)]
    pub spec: CommandSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: String,
    #[serde(flatten)]
    pub spec: CommandSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeCatalog {
    #[serde(default, rename = "probe")]
    pub probes: Vec<ProbeEntry>,
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionEntry>,
}

impl ProbeCatalog {
    pub fn parse(content: &str) -> Result<Self> {
        let catalog: ProbeCatalog = toml::from_str(content)
            .map_err(|e| HealthError::Configuration(format!("Invalid probe catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            HealthError::Configuration(format!(
                "Failed to read probe catalog {}: {e}",
                path.display()
            ))
        })?;
        let catalog = Self::parse(&content)?;
        info!(
            probes = catalog.probes.len(),
            actions = catalog.actions.len(),
            "Loaded probe catalog from {}",
            path.display()
        );
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let mut modules = HashSet::new();
        for probe in &self.probes {
            if probe.module.trim().is_empty() || probe.spec.command.trim().is_empty() {
                return Err(HealthError::Configuration(
                    "probe entries need a module and a command".into(),
                ));
            }
            if !modules.insert(probe.module.as_str()) {
                return Err(HealthError::Configuration(format!(
                    "probe for module {} declared twice",
                    probe.module
                )));
            }
        }
        let mut ids = HashSet::new();
        for action in &self.actions {
            if action.id.trim().is_empty() || action.spec.command.trim().is_empty() {
                return Err(HealthError::Configuration(
                    "action entries need an id and a command".into(),
                ));
            }
            if !ids.insert(action.id.as_str()) {
                return Err(HealthError::Configuration(format!(
                    "action {} declared twice",
                    action.id
                )));
            }
        }
        Ok(())
    }

    pub fn register_probes(&self, registry: &mut ProbeRegistry) {
        for entry in &self.probes {
            registry.register(
                entry.module.clone(),
                Arc::new(CommandProbe::new(entry.spec.clone())),
            );
        }
    }

    pub fn action_executor(&self) -> CommandActionExecutor {
        CommandActionExecutor::new(
            self.actions
                .iter()
                .map(|a| (a.id.clone(), a.spec.clone()))
                .collect(),
        )
    }
}

/// Runs a program and reads a JSON probe report from its stdout.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    spec: CommandSpec,
}

impl CommandProbe {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self) -> anyhow::Result<ProbeReport> {
        let output = self
            .spec
            .build()
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.spec.command))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.spec.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("{} did not print a valid probe report", self.spec.command))
    }
}

/// Maps action ids to programs. An action succeeds when its program exits 0.
#[derive(Debug, Clone, Default)]
pub struct CommandActionExecutor {
    actions: HashMap<String, CommandSpec>,
}

impl CommandActionExecutor {
    pub fn new(actions: HashMap<String, CommandSpec>) -> Self {
        Self { actions }
    }

    pub fn knows(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }
}

#[async_trait]
impl ActionExecutor for CommandActionExecutor {
    async fn execute(&self, action: &str, module: &str) -> anyhow::Result<()> {
        let Some(spec) = self.actions.get(action) else {
            bail!("unknown remediation action: {action}");
        };
        debug!(action, module, command = %spec.command, "Running remediation action");
        let status = spec
            .build()
            .env(MODULE_ENV, module)
            .status()
            .await
            .with_context(|| format!("failed to start {}", spec.command))?;
        if !status.success() {
            bail!("{} exited with {}", spec.command, status);
        }
        Ok(())
    }
}
