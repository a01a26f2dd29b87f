//! # Deploy-Config
//!
//! Declarative description of one stack. Loaded from YAML files under the
//! config base directory of a repository, or supplied inline in a poll
//! config. One file may declare multiple stacks as separate YAML documents.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Declarative description of one stack (see the deploy-config schema in the
/// README). `name` is the join-point between host state and repository state
/// and must be unique within the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DeployConfig {
    /// Stack name, unique within the host
    pub name: String,
    /// Git ref or SHA to check out
    #[serde(default = "default_reference")]
    pub reference: String,
    /// Subdirectory inside the repository
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Ordered list of compose file paths, relative to `working_dir`.
    /// When empty, the first existing well-known compose file name is used.
    #[serde(default)]
    pub compose_files: Vec<String>,
    /// Ordered list of env files, relative to `working_dir`
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Optional remote repository override
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub force_image_pull: bool,
    #[serde(default)]
    pub force_recreate: bool,
    #[serde(default = "default_true")]
    pub remove_orphans: bool,
    /// Flips the lifecycle to "remove"
    #[serde(default)]
    pub destroy: bool,
    #[serde(default)]
    pub destroy_opts: DestroyOpts,
    /// Map of env-name to opaque reference resolved by the secret resolver
    #[serde(default)]
    pub external_secrets: BTreeMap<String, String>,
    /// Expand this config into one per immediate subdirectory of
    /// `working_dir` that contains the declared compose file(s)
    #[serde(default)]
    pub auto_discover: bool,
    #[serde(default)]
    pub auto_discover_opts: AutoDiscoverOpts,
    /// Regex gating which webhook refs trigger this stack
    #[serde(default)]
    pub webhook_event_filter: Option<String>,
    #[serde(default)]
    pub build_opts: BuildOpts,
    /// Seconds to wait for service convergence
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Recurse submodules on clone/update
    #[serde(default)]
    pub submodules: bool,
}

/// Post-destroy cleanup knobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DestroyOpts {
    #[serde(default)]
    pub remove_volumes: bool,
    #[serde(default)]
    pub remove_images: bool,
    #[serde(default)]
    pub remove_repo_dir: bool,
}

/// Auto-discovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AutoDiscoverOpts {
    /// Destroy discovered stacks whose directory disappears
    #[serde(default = "default_true")]
    pub delete: bool,
}

impl Default for AutoDiscoverOpts {
    fn default() -> Self {
        Self { delete: true }
    }
}

/// Image-build knobs passed through to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BuildOpts {
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub force_image_pull: bool,
}

fn default_reference() -> String {
    "main".to_string()
}

fn default_working_dir() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    constants::DEFAULT_DEPLOY_TIMEOUT_SECS
}

impl DeployConfig {
    /// Synthetic config used when a polled repository carries no config file
    /// and the poll entry declares no inline deployments.
    pub fn synthetic(name: &str, reference: &str) -> Self {
        Self {
            name: name.to_string(),
            reference: reference.to_string(),
            working_dir: default_working_dir(),
            compose_files: Vec::new(),
            env_files: Vec::new(),
            repository_url: None,
            force_image_pull: false,
            force_recreate: false,
            remove_orphans: true,
            destroy: false,
            destroy_opts: DestroyOpts::default(),
            external_secrets: BTreeMap::new(),
            auto_discover: false,
            auto_discover_opts: AutoDiscoverOpts::default(),
            webhook_event_filter: None,
            build_opts: BuildOpts::default(),
            timeout: default_timeout(),
            submodules: false,
        }
    }

    /// Validate fields that serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("deploy-config name must not be empty");
        }
        if self.name.contains('/') || self.name.contains("..") {
            anyhow::bail!("deploy-config name '{}' contains path separators", self.name);
        }
        if self.working_dir.split('/').any(|part| part == "..") {
            anyhow::bail!(
                "working_dir '{}' must not escape the repository",
                self.working_dir
            );
        }
        if let Some(filter) = &self.webhook_event_filter {
            regex::Regex::new(filter).with_context(|| {
                format!("webhook_event_filter '{filter}' is not a valid regex")
            })?;
        }
        Ok(())
    }
}

/// Read all deploy-configs below `<repo_root>/<config_dir>`.
///
/// Every `*.yaml` / `*.yml` file is parsed as a multi-document YAML stream,
/// so one file may declare several stacks. When `custom_target` is set, only
/// configs whose `name` matches it are returned.
pub fn load_deploy_configs(
    repo_root: &Path,
    config_dir: &str,
    custom_target: Option<&str>,
) -> Result<Vec<DeployConfig>> {
    let base = repo_root.join(config_dir);
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = std::fs::read_dir(&base)
        .with_context(|| format!("failed to read config dir {}", base.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    let mut configs = Vec::new();
    for path in entries {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for document in serde_yaml::Deserializer::from_str(&raw) {
            let config = DeployConfig::deserialize(document)
                .with_context(|| format!("invalid deploy-config in {}", path.display()))?;
            config.validate()?;
            configs.push(config);
        }
    }

    if let Some(target) = custom_target {
        configs.retain(|c| c.name == target);
    }

    Ok(configs)
}
