//! # Reconciliation Pipeline
//!
//! Drives one job from (repository, reference) to committed deployments:
//!
//! 1. Prepare: path sanitization under the data root, auth selection
//! 2. Fetch: clone or update the checkout
//! 3. Decrypt secrets-at-rest before the compose loader sees them
//! 4. Resolve deploy-configs (files, inline, synthetic, auto-discovery)
//! 5. Reap orphaned auto-discovered stacks
//! 6. Per stack: limiter admission, ownership check, change detection,
//!    then the state machine (apply / destroy / skip)
//! 7. Commit the outcome: notification + metrics
//!
//! A stage error aborts the affected stack only; other stacks of the same
//! job continue.

pub mod changes;
pub mod configs;
mod reap;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DeployConfig};
use crate::constants::{self, labels, DEFAULT_COMPOSE_FILE_NAMES, POLL_TRIGGER};
use crate::engine::compose::ComposeProject;
use crate::engine::{ContainerEngine, DeployPlan, DestroyOptions};
use crate::errors::JobError;
use crate::git::{normalize_ref, short_sha, GitAuth, GitClient};
use crate::job::Job;
use crate::limiter::DeployLimiter;
use crate::locks::RepoLockRegistry;
use crate::loopdetect::LoopDetector;
use crate::notify::{Notifier, NotifyLevel};
use crate::observability::metrics;
use crate::repo;
use crate::secrets::{ResolvedSecrets, SecretResolver};
use crate::webhook::ParsedPayload;

use changes::{decide, ChangeDecision, ChangeInputs};

/// What happened to the stacks of one job.
#[derive(Debug, Default)]
pub struct JobOutcome {
    pub deployed: Vec<String>,
    pub skipped: Vec<String>,
    pub destroyed: Vec<String>,
    /// Resolved HEAD of the primary checkout
    pub commit: String,
}

impl JobOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} deployed, {} skipped, {} destroyed",
            self.deployed.len(),
            self.skipped.len(),
            self.destroyed.len()
        )
    }
}

#[derive(Debug)]
enum StackOutcome {
    Deployed,
    Skipped,
    Destroyed,
}

/// Stage failures abort the whole job and are notified once here; stack
/// failures were already notified individually inside the stack loop.
enum JobFailure {
    Stage(JobError),
    Stacks(JobError),
}

/// The pipeline and its collaborators.
pub struct Reconciler {
    pub config: AppConfig,
    pub engine: Arc<dyn ContainerEngine>,
    pub git: GitClient,
    pub resolver: Arc<dyn SecretResolver>,
    pub limiter: Arc<DeployLimiter>,
    pub locks: Arc<RepoLockRegistry>,
    pub loops: Arc<LoopDetector>,
    pub notifier: Notifier,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn ContainerEngine>,
        resolver: Arc<dyn SecretResolver>,
        cancel: CancellationToken,
    ) -> Self {
        let ttl = std::time::Duration::from_secs(config.lock_timeout_secs);
        let notifier = Notifier::new(config.notify_url.clone(), config.notify_level);
        let git = GitClient::new(config.skip_tls_verification);
        Self {
            limiter: Arc::new(DeployLimiter::new(config.max_concurrent_deployments, ttl)),
            locks: Arc::new(RepoLockRegistry::new(ttl)),
            loops: Arc::new(LoopDetector::new()),
            notifier,
            git,
            engine,
            resolver,
            config,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one job to completion. The caller must already hold the
    /// repository lock for `job.repository_name`.
    pub async fn run_job(
        &self,
        job: &Job,
        inline: Option<Vec<DeployConfig>>,
    ) -> Result<JobOutcome, JobError> {
        info!(
            job_id = job.job_id,
            repository = job.repository_name,
            reference = job.reference,
            trigger = job.trigger.as_str(),
            "job started"
        );

        match self.run_job_inner(job, inline).await {
            Ok(outcome) => {
                info!(
                    job_id = job.job_id,
                    repository = job.repository_name,
                    summary = outcome.summary(),
                    elapsed_secs = job.elapsed().as_secs_f64(),
                    "job finished"
                );
                self.notifier.send(
                    NotifyLevel::Info,
                    "Deployment successful",
                    &outcome.summary(),
                    &[
                        ("repository", &job.repository_name),
                        (
                            "revision",
                            &format!(
                                "{} ({})",
                                normalize_ref(&job.reference),
                                short_sha(&outcome.commit)
                            ),
                        ),
                        ("job_id", &job.job_id),
                    ],
                );
                Ok(outcome)
            }
            Err(JobFailure::Stage(e)) => {
                error!(
                    job_id = job.job_id,
                    repository = job.repository_name,
                    kind = e.kind(),
                    error = %e,
                    "job failed"
                );
                metrics::increment_deployment_errors(e.kind());
                self.notifier.send(
                    NotifyLevel::Error,
                    "Deployment failed",
                    &e.to_string(),
                    &[
                        ("repository", &job.repository_name),
                        ("job_id", &job.job_id),
                    ],
                );
                Err(e)
            }
            // Per-stack paths already notified and counted
            Err(JobFailure::Stacks(e)) => Err(e),
        }
    }

    async fn run_job_inner(
        &self,
        job: &Job,
        inline: Option<Vec<DeployConfig>>,
    ) -> Result<JobOutcome, JobFailure> {
        let clone_root = repo::clone_path(&self.config.data_mount_point, &job.repository_name)
            .map_err(JobFailure::Stage)?;
        let (url, auth) = self.select_auth(&job.payload).map_err(JobFailure::Stage)?;

        let latest_commit = self
            .git
            .clone_or_update(&url, &job.reference, &clone_root, &auth, false)
            .await
            .map_err(JobFailure::Stage)?;

        crate::sops::decrypt_repo_files(&clone_root)
            .await
            .map_err(JobFailure::Stage)?;

        let resolved = configs::resolve_configs(
            job,
            &clone_root,
            &self.config.deploy_config_dir,
            inline,
        )
        .map_err(JobFailure::Stage)?;

        // A second pass with submodules when any stack asks for them;
        // idempotent on an up-to-date checkout
        if resolved.configs.iter().any(|c| c.submodules) {
            self.git
                .clone_or_update(&url, &job.reference, &clone_root, &auth, true)
                .await
                .map_err(JobFailure::Stage)?;
        }

        let mut outcome = JobOutcome {
            commit: latest_commit.clone(),
            ..JobOutcome::default()
        };

        outcome.destroyed = reap::reap_orphans(self, job, &resolved)
            .await
            .map_err(JobFailure::Stage)?;

        let mut first_failure: Option<JobError> = None;
        for config in &resolved.configs {
            let started = Instant::now();
            match self
                .reconcile_stack(job, &clone_root, &latest_commit, config)
                .await
            {
                Ok(StackOutcome::Deployed) => {
                    metrics::increment_deployments_total();
                    metrics::observe_deployment_duration(started.elapsed().as_secs_f64());
                    outcome.deployed.push(config.name.clone());
                }
                Ok(StackOutcome::Skipped) => outcome.skipped.push(config.name.clone()),
                Ok(StackOutcome::Destroyed) => outcome.destroyed.push(config.name.clone()),
                Err(e) => {
                    error!(
                        job_id = job.job_id,
                        stack = config.name,
                        kind = e.kind(),
                        error = %e,
                        "stack reconciliation failed"
                    );
                    metrics::increment_deployment_errors(e.kind());
                    self.notifier.send(
                        NotifyLevel::Error,
                        "Deployment failed",
                        &e.to_string(),
                        &[
                            ("repository", &job.repository_name),
                            ("stack", &config.name),
                            ("job_id", &job.job_id),
                        ],
                    );
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(JobFailure::Stacks(e)),
            None => Ok(outcome),
        }
    }

    /// The per-stack state machine: admission through the limiter, then
    /// ownership check, destroy or change detection + apply.
    async fn reconcile_stack(
        &self,
        job: &Job,
        clone_root: &Path,
        latest_commit: &str,
        config: &DeployConfig,
    ) -> Result<StackOutcome, JobError> {
        config
            .validate()
            .map_err(|e| JobError::DeployConfigInvalid(e.to_string()))?;

        let ref_short = normalize_ref(&config.reference).to_string();
        let _slot = self
            .limiter
            .acquire(&job.repository_name, &ref_short, &self.cancel)
            .await
            .map_err(|_| JobError::Internal(anyhow::anyhow!("daemon is shutting down")))?;

        // The stack may live in a different repository than the trigger
        let (stack_root, stack_commit) = match &config.repository_url {
            Some(url) if *url != job.payload.clone_url => {
                self.checkout_override_repo(url, &ref_short, config.submodules)
                    .await?
            }
            _ => (clone_root.to_path_buf(), latest_commit.to_string()),
        };

        let existing = self.engine.stack_labels(&config.name).await?;

        if let Some(existing_labels) = &existing {
            let owner = existing_labels
                .get(labels::REPOSITORY_NAME)
                .cloned()
                .unwrap_or_default();
            if owner != job.payload.full_name {
                // Never overwrite another repository's stack
                return Err(JobError::DeploymentConflict {
                    name: config.name.clone(),
                    owner,
                });
            }
        }

        if config.destroy {
            let Some(existing_labels) = &existing else {
                info!(
                    job_id = job.job_id,
                    stack = config.name,
                    "destroy requested but nothing is deployed, skipping"
                );
                return Ok(StackOutcome::Skipped);
            };
            if existing_labels.get(labels::MANAGER).map(String::as_str)
                != Some(constants::APP_NAME)
            {
                return Err(JobError::NotManaged(config.name.clone()));
            }
            self.destroy_stack(job, config).await?;
            return Ok(StackOutcome::Destroyed);
        }

        let working_dir = repo::working_dir_path(&stack_root, &config.working_dir)?;
        let compose_files = resolve_compose_files(&working_dir, &config.compose_files)?;
        let project = ComposeProject::load(&compose_files)
            .map_err(|e| JobError::DeployConfigInvalid(e.to_string()))?;
        let env_files = resolve_env_files(&working_dir, &config.env_files)?;

        let secrets = self.resolver.resolve(&config.external_secrets).await?;
        let new_hash = secrets.hash();
        let environment = interpolation_env(&env_files, &secrets);

        let loop_forced = self.loops.should_force_deploy(
            &config.name,
            &stack_commit,
            self.config.max_deployment_loops,
        );

        let decision = match &existing {
            None => ChangeDecision::Deploy {
                force_recreate: false,
                reason: "stack not deployed yet",
            },
            Some(existing_labels) => {
                let deployed_commit = existing_labels.get(labels::COMMIT_SHA).cloned();
                let changed_files = match deployed_commit.as_deref() {
                    Some(deployed) if deployed != stack_commit => {
                        self.git
                            .changed_files(&stack_root, deployed, &stack_commit)
                            .await?
                    }
                    _ => Some(Vec::new()),
                };

                let desired_images = project.service_images(&environment);
                let deployed_images = self.engine.service_images(&config.name).await?;
                let image_drift = desired_images.iter().any(|(service, image)| {
                    deployed_images.get(service).map(|d| d != image).unwrap_or(true)
                });

                let mut referenced_paths = project.referenced_paths(&config.working_dir);
                for file in &config.compose_files {
                    referenced_paths.push(rebase_config_path(&config.working_dir, file));
                }
                for file in &config.env_files {
                    referenced_paths.push(rebase_config_path(&config.working_dir, file));
                }

                decide(&ChangeInputs {
                    deployed_commit,
                    latest_commit: stack_commit.clone(),
                    changed_files,
                    working_dir: config.working_dir.clone(),
                    referenced_paths,
                    deployed_secrets_hash: existing_labels
                        .get(labels::EXTERNAL_SECRETS_HASH)
                        .cloned()
                        .unwrap_or_default(),
                    new_secrets_hash: new_hash.clone(),
                    image_drift,
                    loop_forced,
                })
            }
        };

        let (force_recreate, reason) = match decision {
            ChangeDecision::Skip => {
                info!(
                    job_id = job.job_id,
                    stack = config.name,
                    "no changes, skipping"
                );
                return Ok(StackOutcome::Skipped);
            }
            ChangeDecision::Deploy {
                force_recreate,
                reason,
            } => (force_recreate, reason),
        };

        let plan = DeployPlan {
            name: config.name.clone(),
            working_dir,
            compose_files,
            env_files,
            labels: self.build_labels(job, config, &stack_commit, &new_hash),
            environment,
            force_image_pull: config.force_image_pull,
            force_recreate: config.force_recreate || force_recreate,
            remove_orphans: config.remove_orphans,
            build: project.has_build().then(|| config.build_opts.clone()),
            timeout_secs: config.timeout,
        };

        info!(
            job_id = job.job_id,
            stack = config.name,
            reason,
            force_recreate = plan.force_recreate,
            "applying stack"
        );
        self.engine.apply(&plan).await?;
        Ok(StackOutcome::Deployed)
    }

    async fn checkout_override_repo(
        &self,
        url: &str,
        reference: &str,
        submodules: bool,
    ) -> Result<(PathBuf, String), JobError> {
        let name = repo::normalize_repo_name(url)?;
        let root = repo::clone_path(&self.config.data_mount_point, &name)?;
        let auth = self.auth_for_url(url, false)?;
        let commit = self
            .git
            .clone_or_update(url, reference, &root, &auth, submodules)
            .await?;
        Ok((root, commit))
    }

    fn select_auth(&self, payload: &ParsedPayload) -> Result<(String, GitAuth), JobError> {
        let url_is_ssh =
            payload.clone_url.starts_with("git@") || payload.clone_url.starts_with("ssh://");

        if let Some(key_path) = &self.config.ssh_key_path {
            // A configured key switches to the SSH remote when one exists
            if url_is_ssh || !payload.ssh_url.is_empty() {
                let url = if url_is_ssh {
                    payload.clone_url.clone()
                } else {
                    payload.ssh_url.clone()
                };
                return Ok((
                    url,
                    GitAuth::Ssh {
                        key_path: key_path.clone(),
                    },
                ));
            }
        }

        let auth = self.auth_for_url(&payload.clone_url, payload.private)?;
        Ok((payload.clone_url.clone(), auth))
    }

    fn auth_for_url(&self, url: &str, private: bool) -> Result<GitAuth, JobError> {
        if url.starts_with("git@") || url.starts_with("ssh://") {
            return match &self.config.ssh_key_path {
                Some(key_path) => Ok(GitAuth::Ssh {
                    key_path: key_path.clone(),
                }),
                None => Err(JobError::MissingAccessToken),
            };
        }
        match &self.config.git_access_token {
            Some(token) => Ok(GitAuth::Token {
                username: self.config.auth_type.clone(),
                token: token.clone(),
            }),
            None if private => Err(JobError::MissingAccessToken),
            None => Ok(GitAuth::None),
        }
    }

    async fn destroy_stack(&self, job: &Job, config: &DeployConfig) -> Result<(), JobError> {
        let opts = DestroyOptions {
            remove_volumes: config.destroy_opts.remove_volumes,
            remove_images: config.destroy_opts.remove_images,
        };
        info!(
            job_id = job.job_id,
            stack = config.name,
            remove_volumes = opts.remove_volumes,
            "destroying stack"
        );
        self.engine.destroy(&config.name, &opts).await?;
        self.loops.reset(&config.name);

        if config.destroy_opts.remove_repo_dir {
            let clone_root =
                repo::clone_path(&self.config.data_mount_point, &job.repository_name)?;
            if let Err(e) = std::fs::remove_dir_all(&clone_root) {
                warn!(
                    job_id = job.job_id,
                    path = %clone_root.display(),
                    error = %e,
                    "failed to remove repository directory"
                );
            } else if let Some(parent) = clone_root.parent() {
                // Drop the owner directory too once its last clone is gone
                if parent != self.config.data_mount_point
                    && std::fs::read_dir(parent)
                        .map(|mut entries| entries.next().is_none())
                        .unwrap_or(false)
                {
                    let _ = std::fs::remove_dir(parent);
                }
            }
        }
        Ok(())
    }

    /// The full managed-resource label set for one deployment.
    fn build_labels(
        &self,
        job: &Job,
        config: &DeployConfig,
        commit: &str,
        secrets_hash: &str,
    ) -> BTreeMap<String, String> {
        let trigger_commit = job
            .commit_sha
            .clone()
            .unwrap_or_else(|| POLL_TRIGGER.to_string());
        [
            (labels::MANAGER, constants::APP_NAME.to_string()),
            (labels::VERSION, constants::APP_VERSION.to_string()),
            (labels::DEPLOYMENT_NAME, config.name.clone()),
            (
                labels::TARGET_REF,
                normalize_ref(&config.reference).to_string(),
            ),
            (labels::COMMIT_SHA, commit.to_string()),
            (labels::TRIGGER_COMMIT, trigger_commit),
            (
                labels::TIMESTAMP,
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
            (labels::WORKING_DIR, config.working_dir.clone()),
            (labels::EXTERNAL_SECRETS_HASH, secrets_hash.to_string()),
            (labels::AUTO_DISCOVER, config.auto_discover.to_string()),
            (
                labels::AUTO_DISCOVER_DELETE,
                config.auto_discover_opts.delete.to_string(),
            ),
            (labels::REPOSITORY_NAME, job.payload.full_name.clone()),
            (labels::REPOSITORY_URL, job.payload.clone_url.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Pick the compose files for a stack: the declared list (all must exist)
/// or the first well-known name present in the working directory.
fn resolve_compose_files(
    working_dir: &Path,
    declared: &[String],
) -> Result<Vec<PathBuf>, JobError> {
    if declared.is_empty() {
        for name in DEFAULT_COMPOSE_FILE_NAMES {
            let candidate = working_dir.join(name);
            if candidate.is_file() {
                return Ok(vec![candidate]);
            }
        }
        return Err(JobError::DeployConfigInvalid(format!(
            "no compose file found in {}",
            working_dir.display()
        )));
    }
    declared
        .iter()
        .map(|file| {
            let candidate = working_dir.join(file);
            if candidate.is_file() {
                Ok(candidate)
            } else {
                Err(JobError::DeployConfigInvalid(format!(
                    "compose file '{file}' not found in {}",
                    working_dir.display()
                )))
            }
        })
        .collect()
}

fn resolve_env_files(working_dir: &Path, declared: &[String]) -> Result<Vec<PathBuf>, JobError> {
    declared
        .iter()
        .map(|file| {
            let candidate = working_dir.join(file);
            if candidate.is_file() {
                Ok(candidate)
            } else {
                Err(JobError::DeployConfigInvalid(format!(
                    "env file '{file}' not found in {}",
                    working_dir.display()
                )))
            }
        })
        .collect()
}

/// Interpolation context for the compose loader: process env, then env
/// files in order, then resolved external secrets (highest precedence).
fn interpolation_env(
    env_files: &[PathBuf],
    secrets: &ResolvedSecrets,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for file in env_files {
        if let Ok(entries) = dotenvy::from_path_iter(file) {
            for (key, value) in entries.flatten() {
                env.insert(key, value);
            }
        }
    }
    for (key, value) in secrets.iter() {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Rebase a config-declared relative path onto the stack working dir.
fn rebase_config_path(working_dir: &str, file: &str) -> String {
    if working_dir == "." || working_dir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{file}", working_dir.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_compose_files_probes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let files = resolve_compose_files(tmp.path(), &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("docker-compose.yml"));
    }

    #[test]
    fn test_resolve_compose_files_prefers_modern_name() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("compose.yaml"), "services: {}\n").unwrap();
        std::fs::write(tmp.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let files = resolve_compose_files(tmp.path(), &[]).unwrap();
        assert!(files[0].ends_with("compose.yaml"));
    }

    #[test]
    fn test_resolve_compose_files_missing_declared_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let result = resolve_compose_files(tmp.path(), &["compose.prod.yaml".to_string()]);
        assert!(matches!(result, Err(JobError::DeployConfigInvalid(_))));
    }

    #[test]
    fn test_interpolation_env_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        let env_file = tmp.path().join(".env");
        std::fs::write(&env_file, "FROM_FILE=file\nOVERRIDDEN=file\n").unwrap();
        let secrets = ResolvedSecrets::new(
            [("OVERRIDDEN".to_string(), "secret".to_string())].into(),
        );
        let env = interpolation_env(&[env_file], &secrets);
        assert_eq!(env.get("FROM_FILE").map(String::as_str), Some("file"));
        // External secrets win over env files
        assert_eq!(env.get("OVERRIDDEN").map(String::as_str), Some("secret"));
    }

    #[test]
    fn test_rebase_config_path() {
        assert_eq!(rebase_config_path(".", "compose.yaml"), "compose.yaml");
        assert_eq!(
            rebase_config_path("services/shop", "compose.yaml"),
            "services/shop/compose.yaml"
        );
    }
}
