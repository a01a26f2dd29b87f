//! # Change Detection
//!
//! Decides whether a deployed stack needs a redeploy. Host state (labels on
//! deployed resources) is compared against repository state; the decision
//! is a pure function so every rule is testable without an engine.

/// Everything the decision needs, gathered by the pipeline.
#[derive(Debug, Default)]
pub struct ChangeInputs {
    /// Commit recorded on the deployed stack, `None` right after a fresh
    /// deploy decision was already made
    pub deployed_commit: Option<String>,
    pub latest_commit: String,
    /// Files changed between the two commits; `None` when the diff could
    /// not be computed (history rewrite, unknown commit)
    pub changed_files: Option<Vec<String>>,
    /// Repository-relative working directory of the stack
    pub working_dir: String,
    /// Repository-relative paths the stack depends on outside its working
    /// directory: compose files, env files, bind sources, configs, secrets
    pub referenced_paths: Vec<String>,
    pub deployed_secrets_hash: String,
    pub new_secrets_hash: String,
    /// Any deployed service runs an image different from the desired one
    pub image_drift: bool,
    /// Loop detector fired for this stack
    pub loop_forced: bool,
}

/// Outcome of change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Nothing relevant changed; leave the stack alone
    Skip,
    Deploy {
        force_recreate: bool,
        reason: &'static str,
    },
}

/// Apply the detection rules in order of authority: the loop override wins,
/// then secret drift, then image drift, then the commit diff.
pub fn decide(inputs: &ChangeInputs) -> ChangeDecision {
    if inputs.loop_forced {
        return ChangeDecision::Deploy {
            force_recreate: true,
            reason: "deployment loop detected",
        };
    }

    if inputs.deployed_secrets_hash != inputs.new_secrets_hash {
        return ChangeDecision::Deploy {
            force_recreate: false,
            reason: "external secrets changed",
        };
    }

    if inputs.image_drift {
        return ChangeDecision::Deploy {
            force_recreate: false,
            reason: "image drift",
        };
    }

    let Some(deployed_commit) = inputs.deployed_commit.as_deref() else {
        return ChangeDecision::Deploy {
            force_recreate: false,
            reason: "stack not deployed yet",
        };
    };

    if deployed_commit == inputs.latest_commit {
        return ChangeDecision::Skip;
    }

    match &inputs.changed_files {
        // Diff unavailable: assume everything changed
        None => ChangeDecision::Deploy {
            force_recreate: false,
            reason: "commit diff unavailable",
        },
        Some(files) => {
            let relevant = files.iter().any(|file| {
                is_relevant(file, &inputs.working_dir, &inputs.referenced_paths)
            });
            if relevant {
                ChangeDecision::Deploy {
                    force_recreate: false,
                    reason: "relevant files changed",
                }
            } else {
                ChangeDecision::Skip
            }
        }
    }
}

/// A changed file matters when it lies inside the working directory or
/// under any referenced path (referenced directories match by prefix).
fn is_relevant(file: &str, working_dir: &str, referenced: &[String]) -> bool {
    if working_dir == "." || working_dir.is_empty() {
        return true;
    }
    if in_dir(file, working_dir) {
        return true;
    }
    referenced
        .iter()
        .any(|path| file == path || in_dir(file, path))
}

fn in_dir(file: &str, dir: &str) -> bool {
    file == dir
        || file
            .strip_prefix(dir)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}
