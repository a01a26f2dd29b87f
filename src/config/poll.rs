//! # Poll Config
//!
//! YAML description of repositories polled on an interval, for hosts that
//! cannot receive webhooks.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;
use crate::constants;

/// One polled repository.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PollConfig {
    /// Clone URL of the repository
    pub url: String,
    /// Git ref to reconcile
    #[serde(default = "default_reference")]
    pub reference: String,
    /// Seconds between runs
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Exit after the first run (one-shot reconcile)
    #[serde(default)]
    pub run_once: bool,
    /// Deploy-config variant to select inside the repository
    #[serde(default)]
    pub custom_target: Option<String>,
    /// Inline deploy-configs; when empty the repository's own config files
    /// are used, falling back to a single synthetic config
    #[serde(default)]
    pub deployments: Vec<DeployConfig>,
}

fn default_reference() -> String {
    "main".to_string()
}

fn default_interval() -> u64 {
    constants::DEFAULT_POLL_INTERVAL_SECS
}

impl PollConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            anyhow::bail!("poll config url must not be empty");
        }
        if self.interval == 0 {
            anyhow::bail!("poll interval for '{}' must be at least 1 second", self.url);
        }
        for deployment in &self.deployments {
            deployment.validate()?;
        }
        Ok(())
    }
}

/// Load and validate the poll-config file (a YAML list of entries).
pub fn load_poll_configs(path: &Path) -> Result<Vec<PollConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read poll config {}", path.display()))?;
    let configs: Vec<PollConfig> = serde_yaml::from_str(&raw)
        .with_context(|| format!("invalid poll config {}", path.display()))?;
    for config in &configs {
        config.validate()?;
    }
    Ok(configs)
}
