//! # Container Engine
//!
//! Abstract interface to the container host. The reconciliation pipeline
//! and the management API only ever talk to the [`ContainerEngine`] trait;
//! the in-tree implementation drives the `docker` CLI.

pub mod compose;
pub mod docker;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::BuildOpts;
use crate::errors::JobError;

/// Engine-level failures, classified so the pipeline can surface the
/// distinct error kinds the API contract promises.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("container engine connection failed: {0}")]
    Connection(String),
    #[error("image pull access denied for '{0}'")]
    ImagePullAccessDenied(String),
    #[error("services did not converge within {0} seconds")]
    ConvergenceTimeout(u64),
    #[error("project '{0}' not found")]
    NotFound(String),
    #[error("engine command failed: {0}")]
    Command(String),
}

impl From<EngineError> for JobError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Connection(message) => JobError::EngineConnectionFailed(message),
            EngineError::ImagePullAccessDenied(image) => JobError::ImagePullAccessDenied(image),
            EngineError::ConvergenceTimeout(secs) => JobError::ServiceConvergenceTimeout(secs),
            other => JobError::Internal(anyhow::anyhow!(other)),
        }
    }
}

/// One managed stack as seen on the host: its name plus the full label set
/// of a representative resource.
#[derive(Debug, Clone)]
pub struct ManagedStack {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Compose project summary for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub config_files: String,
}

/// Swarm stack summary for the management API.
#[derive(Debug, Clone, Serialize)]
pub struct StackSummary {
    pub name: String,
    pub services: u64,
}

/// Everything the engine needs to bring one stack to its desired state.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub name: String,
    /// Directory the compose project resolves relative paths from
    pub working_dir: PathBuf,
    /// Ordered compose files, already validated to exist
    pub compose_files: Vec<PathBuf>,
    pub env_files: Vec<PathBuf>,
    /// Managed-resource labels attached to every created resource
    pub labels: BTreeMap<String, String>,
    /// Interpolation environment, including resolved external secrets
    pub environment: BTreeMap<String, String>,
    pub force_image_pull: bool,
    pub force_recreate: bool,
    pub remove_orphans: bool,
    pub build: Option<BuildOpts>,
    /// Seconds to wait for service convergence
    pub timeout_secs: u64,
}

/// Post-destroy cleanup toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    pub remove_volumes: bool,
    pub remove_images: bool,
}

/// Lifecycle operations exposed by the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Stop,
    Restart,
}

impl LifecycleOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Interface to the container host, in both standalone and swarm-manager
/// modes. All state queries go through labels; the engine is the only
/// component that touches the container API.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verify the engine connection. Health checks gate on this.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Whether the host is a swarm manager (deploys use stacks) or a
    /// standalone engine (deploys use compose projects).
    async fn swarm_manager(&self) -> Result<bool, EngineError>;

    /// All stacks carrying the manager ownership label, deduplicated by
    /// deployment name.
    async fn list_managed_stacks(&self) -> Result<Vec<ManagedStack>, EngineError>;

    /// Label set of a deployed stack, `None` when nothing with that name
    /// exists on the host. Resources deployed by other tools are returned
    /// too (with their foreign or absent labels) so ownership checks can
    /// refuse to touch them.
    async fn stack_labels(&self, name: &str)
        -> Result<Option<BTreeMap<String, String>>, EngineError>;

    /// Currently running image per service of a deployed stack.
    async fn service_images(&self, name: &str) -> Result<BTreeMap<String, String>, EngineError>;

    /// Bring one stack to its desired state and wait for convergence.
    async fn apply(&self, plan: &DeployPlan) -> Result<(), EngineError>;

    /// Tear one stack down, honoring the cleanup options.
    async fn destroy(&self, name: &str, opts: &DestroyOptions) -> Result<(), EngineError>;

    // --- management surface ---

    async fn list_projects(&self, all: bool) -> Result<Vec<ProjectSummary>, EngineError>;

    async fn list_stacks(&self) -> Result<Vec<StackSummary>, EngineError>;

    async fn project_lifecycle(
        &self,
        name: &str,
        op: LifecycleOp,
        timeout: Option<u64>,
    ) -> Result<(), EngineError>;

    async fn scale_service(
        &self,
        stack: &str,
        service: &str,
        replicas: u64,
        wait: bool,
    ) -> Result<(), EngineError>;

    /// Force a rolling restart of every service in a swarm stack.
    async fn restart_stack(&self, stack: &str) -> Result<(), EngineError>;

    /// Re-trigger job-mode services of a stack.
    async fn run_stack_jobs(&self, stack: &str) -> Result<(), EngineError>;
}
