//! # Deploy-Config Resolution
//!
//! Turns a job into the concrete list of deploy-configs to reconcile:
//! in-repo config files for webhook jobs, inline deployments for poll jobs,
//! a synthetic fallback when neither exists, auto-discovery expansion, and
//! the webhook ref filter.

use std::path::Path;

use tracing::{debug, info};

use crate::config::DeployConfig;
use crate::constants::DEFAULT_COMPOSE_FILE_NAMES;
use crate::errors::JobError;
use crate::job::{Job, Trigger};
use crate::repo;

/// Resolution result: the expanded config list plus the working-directory
/// parents that auto-discovery scanned (the reaper's scope).
#[derive(Debug, Default)]
pub struct ResolvedConfigs {
    pub configs: Vec<DeployConfig>,
    pub discover_parents: Vec<String>,
}

/// Resolve the deploy-configs for `job` against a checkout at `clone_root`.
///
/// `inline` carries a poll config's `deployments` list; webhook jobs pass
/// `None` and read the repository's config files. When neither yields a
/// config, a single synthetic config named after the repository short name
/// is used.
pub fn resolve_configs(
    job: &Job,
    clone_root: &Path,
    config_dir: &str,
    inline: Option<Vec<DeployConfig>>,
) -> Result<ResolvedConfigs, JobError> {
    let mut configs = match inline {
        Some(deployments) if !deployments.is_empty() => {
            let mut deployments = deployments;
            // Inline deployments inherit the poll reference
            for config in &mut deployments {
                config.reference = job.reference.clone();
            }
            deployments
        }
        _ => crate::config::load_deploy_configs(
            clone_root,
            config_dir,
            job.custom_target.as_deref(),
        )
        .map_err(|e| JobError::DeployConfigInvalid(e.to_string()))?,
    };

    if configs.is_empty() {
        let name = repo::short_name(&job.repository_name).to_string();
        info!(
            job_id = job.job_id,
            stack = name,
            "no deploy-config found, using synthetic default"
        );
        configs.push(DeployConfig::synthetic(&name, &job.reference));
    }

    if job.trigger == Trigger::Webhook {
        configs.retain(|config| match &config.webhook_event_filter {
            None => true,
            Some(filter) => {
                let matches = regex::Regex::new(filter)
                    .map(|re| re.is_match(&job.reference))
                    .unwrap_or(false);
                if !matches {
                    debug!(
                        job_id = job.job_id,
                        stack = config.name,
                        filter,
                        reference = job.reference,
                        "webhook ref filtered out"
                    );
                }
                matches
            }
        });
    }

    let mut resolved = ResolvedConfigs::default();
    for config in configs {
        if config.auto_discover {
            resolved.discover_parents.push(config.working_dir.clone());
            resolved
                .configs
                .extend(expand_auto_discover(&config, clone_root)?);
        } else {
            resolved.configs.push(config);
        }
    }
    Ok(resolved)
}

/// Expand one auto-discovery config into one config per immediate
/// subdirectory of its working directory that contains the declared
/// compose file(s). The stack name is the subdirectory base name.
fn expand_auto_discover(
    config: &DeployConfig,
    clone_root: &Path,
) -> Result<Vec<DeployConfig>, JobError> {
    let base = repo::working_dir_path(clone_root, &config.working_dir)?;
    if !base.is_dir() {
        return Err(JobError::DeployConfigInvalid(format!(
            "auto-discover working_dir '{}' does not exist",
            config.working_dir
        )));
    }

    let mut expanded = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(&base)
        .map_err(|e| JobError::DeployConfigInvalid(e.to_string()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();

    for dir in entries {
        let Some(stack_name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !has_compose_file(&dir, &config.compose_files) {
            continue;
        }
        let mut discovered = config.clone();
        discovered.name = stack_name.to_string();
        discovered.working_dir = if config.working_dir == "." {
            stack_name.to_string()
        } else {
            format!("{}/{stack_name}", config.working_dir.trim_end_matches('/'))
        };
        discovered.auto_discover = true;
        expanded.push(discovered);
    }

    debug!(
        parent = config.working_dir,
        count = expanded.len(),
        "auto-discovery expanded"
    );
    Ok(expanded)
}

fn has_compose_file(dir: &Path, declared: &[String]) -> bool {
    if declared.is_empty() {
        DEFAULT_COMPOSE_FILE_NAMES
            .iter()
            .any(|name| dir.join(name).is_file())
    } else {
        declared.iter().all(|name| dir.join(name).is_file())
    }
}
