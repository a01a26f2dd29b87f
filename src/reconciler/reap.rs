//! # Auto-Discovery Reaper
//!
//! Removes managed stacks whose source directory disappeared from the
//! repository. Only stacks created by auto-discovery for this repository
//! are considered, and only inside working-directory parents this job
//! actually scanned, so two instances watching different subtrees of one
//! repository never reap each other's stacks.

use tracing::{info, warn};

use super::configs::ResolvedConfigs;
use super::Reconciler;
use crate::constants::labels;
use crate::engine::{ContainerEngine, DestroyOptions};
use crate::errors::JobError;
use crate::job::Job;

/// Destroy auto-discovered stacks of this repository that no longer have a
/// matching deploy-config. Returns the names of destroyed stacks.
pub(super) async fn reap_orphans(
    reconciler: &Reconciler,
    job: &Job,
    resolved: &ResolvedConfigs,
) -> Result<Vec<String>, JobError> {
    if resolved.discover_parents.is_empty() {
        return Ok(Vec::new());
    }

    let managed = reconciler.engine.list_managed_stacks().await?;
    let mut destroyed = Vec::new();

    for stack in managed {
        let stack_labels = &stack.labels;
        if stack_labels.get(labels::REPOSITORY_URL) != Some(&job.payload.clone_url) {
            continue;
        }
        if stack_labels.get(labels::AUTO_DISCOVER).map(String::as_str) != Some("true") {
            continue;
        }
        let Some(working_dir) = stack_labels.get(labels::WORKING_DIR) else {
            continue;
        };
        if !resolved
            .discover_parents
            .iter()
            .any(|parent| parent_of(working_dir) == parent.trim_end_matches('/'))
        {
            continue;
        }
        if resolved.configs.iter().any(|c| c.name == stack.name) {
            continue;
        }
        if stack_labels
            .get(labels::AUTO_DISCOVER_DELETE)
            .map(String::as_str)
            == Some("false")
        {
            info!(
                job_id = job.job_id,
                stack = stack.name,
                "orphaned stack kept, deletion disabled by label"
            );
            continue;
        }
        if stack_labels.get(labels::REPOSITORY_NAME) != Some(&job.payload.full_name) {
            warn!(
                job_id = job.job_id,
                stack = stack.name,
                "orphaned stack owned by another repository, not touching it"
            );
            continue;
        }

        info!(
            job_id = job.job_id,
            stack = stack.name,
            working_dir,
            "destroying orphaned auto-discovered stack"
        );
        reconciler
            .engine
            .destroy(&stack.name, &DestroyOptions::default())
            .await?;
        reconciler.loops.reset(&stack.name);
        destroyed.push(stack.name);
    }

    Ok(destroyed)
}

/// Immediate parent of a repository-relative working directory;
/// `services/web` -> `services`, `web` -> `.`.
fn parent_of(working_dir: &str) -> &str {
    match working_dir.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) => parent,
        None => ".",
    }
}
