//! Shared fixtures: an in-memory engine that records every call, a test
//! configuration, and local git repository helpers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;

use doco_cd::config::AppConfig;
use doco_cd::constants::{self, labels};
use doco_cd::engine::compose::ComposeProject;
use doco_cd::engine::{
    ContainerEngine, DeployPlan, DestroyOptions, EngineError, LifecycleOp, ManagedStack,
    ProjectSummary, StackSummary,
};
use doco_cd::notify::NotifyLevel;

/// Engine double: label-keyed in-memory state plus a call log.
#[derive(Default)]
pub struct MockEngine {
    pub state: Mutex<MockState>,
}

#[derive(Default)]
pub struct MockState {
    /// Labels per deployed stack
    pub stacks: BTreeMap<String, BTreeMap<String, String>>,
    /// Deployed image per service per stack
    pub images: BTreeMap<String, BTreeMap<String, String>>,
    pub applied: Vec<DeployPlan>,
    pub destroyed: Vec<String>,
}

impl MockEngine {
    pub fn seed_stack(&self, name: &str, stack_labels: BTreeMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .stacks
            .insert(name.to_string(), stack_labels);
    }

    pub fn applied_count(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }

    pub fn last_applied(&self) -> Option<DeployPlan> {
        self.state.lock().unwrap().applied.last().cloned()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn swarm_manager(&self) -> Result<bool, EngineError> {
        Ok(false)
    }

    async fn list_managed_stacks(&self) -> Result<Vec<ManagedStack>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .stacks
            .iter()
            .filter(|(_, l)| l.get(labels::MANAGER).map(String::as_str) == Some("doco-cd"))
            .map(|(name, l)| ManagedStack {
                name: name.clone(),
                labels: l.clone(),
            })
            .collect())
    }

    async fn stack_labels(
        &self,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, EngineError> {
        Ok(self.state.lock().unwrap().stacks.get(name).cloned())
    }

    async fn service_images(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, String>, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .images
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply(&self, plan: &DeployPlan) -> Result<(), EngineError> {
        // Mirror what a real deployment would leave on the host
        let desired = ComposeProject::load(&plan.compose_files)
            .map(|p| p.service_images(&plan.environment))
            .unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.stacks.insert(plan.name.clone(), plan.labels.clone());
        state.images.insert(plan.name.clone(), desired);
        state.applied.push(plan.clone());
        Ok(())
    }

    async fn destroy(&self, name: &str, _opts: &DestroyOptions) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.stacks.remove(name);
        state.images.remove(name);
        state.destroyed.push(name.to_string());
        Ok(())
    }

    async fn list_projects(&self, _all: bool) -> Result<Vec<ProjectSummary>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .stacks
            .keys()
            .map(|name| ProjectSummary {
                name: name.clone(),
                status: "running".to_string(),
                config_files: String::new(),
            })
            .collect())
    }

    async fn list_stacks(&self) -> Result<Vec<StackSummary>, EngineError> {
        Ok(Vec::new())
    }

    async fn project_lifecycle(
        &self,
        name: &str,
        _op: LifecycleOp,
        _timeout: Option<u64>,
    ) -> Result<(), EngineError> {
        if self.state.lock().unwrap().stacks.contains_key(name) {
            Ok(())
        } else {
            Err(EngineError::NotFound(name.to_string()))
        }
    }

    async fn scale_service(
        &self,
        _stack: &str,
        _service: &str,
        _replicas: u64,
        _wait: bool,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn restart_stack(&self, _stack: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn run_stack_jobs(&self, _stack: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

pub fn test_config(data_root: &Path) -> AppConfig {
    AppConfig {
        log_level: "info".to_string(),
        http_port: 8080,
        metrics_port: 9120,
        webhook_secret: "test-webhook-secret".to_string(),
        api_secret: "test-api-secret".to_string(),
        git_access_token: None,
        auth_type: "oauth2".to_string(),
        ssh_key_path: None,
        skip_tls_verification: false,
        data_mount_point: data_root.to_path_buf(),
        max_concurrent_deployments: 4,
        lock_timeout_secs: 60,
        max_payload_size: 1_048_576,
        max_deployment_loops: 3,
        deploy_config_dir: ".doco-cd".to_string(),
        notify_url: None,
        notify_level: NotifyLevel::Error,
        poll_config_file: None,
        external_secrets_provider: "env".to_string(),
    }
}

fn git(args: &[&str], cwd: &Path) {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Initialize a local upstream repository with the given files and return
/// its path (usable directly as a clone URL).
pub fn init_upstream(dir: &Path, files: &[(&str, &str)]) {
    git(&["init", "-b", "main"], dir);
    git(&["config", "user.email", "ci@example.com"], dir);
    git(&["config", "user.name", "ci"], dir);
    write_files(dir, files);
    git(&["add", "."], dir);
    git(&["commit", "-m", "initial"], dir);
}

/// Add or change files and commit.
pub fn commit_files(dir: &Path, files: &[(&str, &str)], message: &str) {
    write_files(dir, files);
    git(&["add", "-A", "."], dir);
    git(&["commit", "-m", message], dir);
}

/// Remove a path and commit.
pub fn commit_removal(dir: &Path, path: &str, message: &str) {
    git(&["rm", "-r", path], dir);
    git(&["commit", "-m", message], dir);
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path: PathBuf = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

/// Labels a previous deployment of this daemon would have left behind.
pub fn managed_labels(
    stack: &str,
    commit: &str,
    repo_full_name: &str,
    clone_url: &str,
) -> BTreeMap<String, String> {
    [
        (labels::MANAGER, constants::APP_NAME),
        (labels::VERSION, constants::APP_VERSION),
        (labels::DEPLOYMENT_NAME, stack),
        (labels::TARGET_REF, "main"),
        (labels::COMMIT_SHA, commit),
        (labels::TRIGGER_COMMIT, commit),
        (labels::TIMESTAMP, "2026-01-01T00:00:00Z"),
        (labels::WORKING_DIR, "."),
        (labels::EXTERNAL_SECRETS_HASH, ""),
        (labels::AUTO_DISCOVER, "false"),
        (labels::AUTO_DISCOVER_DELETE, "true"),
        (labels::REPOSITORY_NAME, repo_full_name),
        (labels::REPOSITORY_URL, clone_url),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
