//! # Docker CLI Engine
//!
//! [`ContainerEngine`] implementation driving the `docker` binary
//! (`docker compose` on standalone hosts, `docker stack` on swarm
//! managers), parsing `--format json` output. Driving the CLI keeps the
//! daemon honest: every operation it performs can be reproduced by an
//! operator at a shell.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::compose::{interpolate, ComposeProject};
use super::{
    ContainerEngine, DeployPlan, DestroyOptions, EngineError, LifecycleOp, ManagedStack,
    ProjectSummary, StackSummary,
};
use crate::constants::{self, labels};

/// Compose attaches this label to every container of a project.
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Compose attaches this label naming the service inside the project.
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
/// Swarm attaches this label to every resource of a stack.
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// How often convergence and teardown progress is re-checked.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long `destroy` waits for swarm tasks to disappear.
const STACK_RM_WAIT_SECS: u64 = 30;

pub struct DockerCli {
    bin: PathBuf,
}

impl DockerCli {
    /// Locate the binary and verify the daemon connection.
    pub async fn connect() -> Result<Self, EngineError> {
        let bin = which::which("docker")
            .map_err(|e| EngineError::Connection(format!("docker binary not found: {e}")))?;
        let cli = Self { bin };
        cli.ping().await?;
        Ok(cli)
    }

    #[cfg(test)]
    fn for_tests() -> Self {
        Self {
            bin: PathBuf::from("docker"),
        }
    }

    async fn run(
        &self,
        args: &[&str],
        envs: &BTreeMap<String, String>,
    ) -> Result<String, EngineError> {
        debug!(args = ?args, "running docker command");
        let output = Command::new(&self.bin)
            .args(args)
            .envs(envs)
            .output()
            .await
            .map_err(|e| EngineError::Connection(format!("failed to spawn docker: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(classify_failure(
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    async fn run_plain(&self, args: &[&str]) -> Result<String, EngineError> {
        self.run(args, &BTreeMap::new()).await
    }

    /// Ids of containers matching a label filter.
    async fn container_ids(&self, filter: &str) -> Result<Vec<String>, EngineError> {
        let out = self
            .run_plain(&["ps", "-a", "--filter", filter, "-q"])
            .await?;
        Ok(lines_of(&out))
    }

    /// `Config.Labels` of the given containers, one map per container.
    async fn container_labels(
        &self,
        ids: &[String],
    ) -> Result<Vec<BTreeMap<String, String>>, EngineError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect", "--format", "{{json .Config.Labels}}"];
        args.extend(ids.iter().map(String::as_str));
        let out = self.run_plain(&args).await?;
        Ok(parse_label_lines(&out))
    }

    /// `Spec.Labels` of the given swarm services.
    async fn service_labels(
        &self,
        ids: &[String],
    ) -> Result<Vec<BTreeMap<String, String>>, EngineError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["service", "inspect", "--format", "{{json .Spec.Labels}}"];
        args.extend(ids.iter().map(String::as_str));
        let out = self.run_plain(&args).await?;
        Ok(parse_label_lines(&out))
    }

    async fn apply_standalone(&self, plan: &DeployPlan) -> Result<(), EngineError> {
        let project = ComposeProject::load(&plan.compose_files)
            .map_err(|e| EngineError::Command(e.to_string()))?;
        let override_doc = label_override(&project, &plan.labels);
        let override_file = write_rendered_file(&plan.working_dir, &override_doc)?;

        let project_dir = plan.working_dir.to_string_lossy().to_string();
        let override_path = override_file.path().to_string_lossy().to_string();
        let file_args: Vec<String> = plan
            .compose_files
            .iter()
            .map(|f| f.to_string_lossy().to_string())
            .collect();
        let env_file_args: Vec<String> = plan
            .env_files
            .iter()
            .map(|f| f.to_string_lossy().to_string())
            .collect();

        let mut base: Vec<&str> = vec![
            "compose",
            "--project-name",
            &plan.name,
            "--project-directory",
            &project_dir,
        ];
        for file in &file_args {
            base.push("-f");
            base.push(file);
        }
        base.push("-f");
        base.push(&override_path);
        for file in &env_file_args {
            base.push("--env-file");
            base.push(file);
        }

        let build_args: Vec<String>;
        if let Some(build) = &plan.build {
            let mut args: Vec<&str> = base.clone();
            args.push("build");
            if build.no_cache {
                args.push("--no-cache");
            }
            if build.quiet {
                args.push("--quiet");
            }
            if build.force_image_pull {
                args.push("--pull");
            }
            build_args = build
                .args
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            for arg in &build_args {
                args.push("--build-arg");
                args.push(arg);
            }
            info!(stack = plan.name, "building images");
            self.run(&args, &plan.environment).await?;
        }

        let timeout_arg = plan.timeout_secs.to_string();
        let mut up: Vec<&str> = base.clone();
        up.extend([
            "up",
            "-d",
            "--quiet-pull",
            "--wait",
            "--wait-timeout",
            &timeout_arg,
        ]);
        if plan.force_recreate {
            up.push("--force-recreate");
        }
        if plan.remove_orphans {
            up.push("--remove-orphans");
        }
        if plan.force_image_pull {
            up.push("--pull");
            up.push("always");
        }

        let deadline = Duration::from_secs(plan.timeout_secs + 60);
        match tokio::time::timeout(deadline, self.run(&up, &plan.environment)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(EngineError::Command(message)))
                if message.contains("timed out") || message.contains("unhealthy") =>
            {
                Err(EngineError::ConvergenceTimeout(plan.timeout_secs))
            }
            Ok(Err(other)) => Err(other),
            Err(_) => Err(EngineError::ConvergenceTimeout(plan.timeout_secs)),
        }
    }

    async fn apply_swarm(&self, plan: &DeployPlan) -> Result<(), EngineError> {
        let project = ComposeProject::load(&plan.compose_files)
            .map_err(|e| EngineError::Command(e.to_string()))?;
        let mut doc = interpolate_doc(project.doc().clone(), &plan.environment);
        attach_swarm_labels(&mut doc, &plan.labels);
        suffix_content_names(&mut doc, &plan.working_dir)
            .map_err(|e| EngineError::Command(e.to_string()))?;

        let rendered = write_rendered_file(&plan.working_dir, &doc)?;
        let rendered_path = rendered.path().to_string_lossy().to_string();

        let resolve = if plan.force_image_pull {
            "always"
        } else {
            "changed"
        };
        let mut args: Vec<&str> = vec![
            "stack",
            "deploy",
            "--compose-file",
            &rendered_path,
            "--with-registry-auth",
            "--detach=true",
            "--resolve-image",
            resolve,
        ];
        if plan.remove_orphans {
            args.push("--prune");
        }
        args.push(&plan.name);
        self.run(&args, &plan.environment).await?;

        self.wait_for_stack_convergence(&plan.name, plan.timeout_secs)
            .await
    }

    /// Poll swarm service state until every replicated service reports all
    /// replicas running, surfacing "No such image" task errors distinctly.
    async fn wait_for_stack_convergence(
        &self,
        name: &str,
        timeout_secs: u64,
    ) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let out = self
                .run_plain(&["stack", "services", name, "--format", "{{json .}}"])
                .await?;
            let services: Vec<ServiceLine> = parse_json_lines(&out);

            if let Some(image) = self.find_image_pull_error(name).await? {
                return Err(EngineError::ImagePullAccessDenied(image));
            }

            let converged = services.iter().all(|s| {
                s.mode.contains("job") || replicas_converged(&s.replicas)
            });
            if converged && !services.is_empty() {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::ConvergenceTimeout(timeout_secs));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn find_image_pull_error(&self, name: &str) -> Result<Option<String>, EngineError> {
        let out = self
            .run_plain(&["stack", "ps", name, "--no-trunc", "--format", "{{json .}}"])
            .await?;
        let tasks: Vec<TaskLine> = parse_json_lines(&out);
        Ok(tasks
            .into_iter()
            .find(|t| t.error.contains("No such image"))
            .map(|t| strip_digest(&t.image).to_string()))
    }

    async fn destroy_standalone(
        &self,
        name: &str,
        opts: &DestroyOptions,
    ) -> Result<(), EngineError> {
        let mut args = vec!["compose", "--project-name", name, "down", "--remove-orphans"];
        if opts.remove_volumes {
            args.push("--volumes");
        }
        if opts.remove_images {
            args.push("--rmi");
            args.push("all");
        }
        self.run_plain(&args).await?;

        if opts.remove_volumes {
            self.remove_labeled_volumes(&format!("label={}={name}", labels::DEPLOYMENT_NAME))
                .await?;
        }
        Ok(())
    }

    async fn destroy_swarm(&self, name: &str, opts: &DestroyOptions) -> Result<(), EngineError> {
        match self.run_plain(&["stack", "rm", name]).await {
            Ok(_) => {}
            Err(EngineError::Command(message))
                if message.to_lowercase().contains("nothing found in stack") =>
            {
                return Ok(());
            }
            Err(other) => return Err(other),
        }

        // Volumes cannot be removed while their tasks still exist
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(STACK_RM_WAIT_SECS);
        loop {
            match self.run_plain(&["stack", "ps", name, "-q"]).await {
                Ok(out) if lines_of(&out).is_empty() => break,
                Err(_) => break,
                Ok(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(stack = name, "tasks still draining after stack rm");
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if opts.remove_volumes {
            self.remove_labeled_volumes(&format!("label={STACK_NAMESPACE_LABEL}={name}"))
                .await?;
        }

        for kind in ["config", "secret"] {
            let out = self
                .run_plain(&[
                    kind,
                    "ls",
                    "--filter",
                    &format!("label={STACK_NAMESPACE_LABEL}={name}"),
                    "-q",
                ])
                .await?;
            for id in lines_of(&out) {
                match self.run_plain(&[kind, "rm", &id]).await {
                    Ok(_) => {}
                    Err(EngineError::Command(message)) if message.contains("in use") => {
                        debug!(kind, id, "skipping in-use resource");
                    }
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(())
    }

    /// Volumes can stay "in use" briefly while containers drain; retry a
    /// few times before giving up.
    async fn remove_labeled_volumes(&self, filter: &str) -> Result<(), EngineError> {
        let out = self
            .run_plain(&["volume", "ls", "--filter", filter, "-q"])
            .await?;
        let mut pending = lines_of(&out);

        for attempt in 0..constants::VOLUME_REMOVE_RETRIES {
            if pending.is_empty() {
                return Ok(());
            }
            let mut still_in_use = Vec::new();
            for volume in &pending {
                match self.run_plain(&["volume", "rm", volume]).await {
                    Ok(_) => {}
                    Err(EngineError::Command(message)) if message.contains("in use") => {
                        still_in_use.push(volume.clone());
                    }
                    Err(EngineError::Command(message)) if message.contains("no such volume") => {}
                    Err(other) => return Err(other),
                }
            }
            pending = still_in_use;
            if !pending.is_empty() && attempt + 1 < constants::VOLUME_REMOVE_RETRIES {
                tokio::time::sleep(Duration::from_secs(
                    constants::VOLUME_REMOVE_RETRY_DELAY_SECS,
                ))
                .await;
            }
        }

        if pending.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Command(format!(
                "volumes still in use after retries: {}",
                pending.join(", ")
            )))
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<(), EngineError> {
        self.run_plain(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn swarm_manager(&self) -> Result<bool, EngineError> {
        let out = self
            .run_plain(&["info", "--format", "{{.Swarm.ControlAvailable}}"])
            .await?;
        Ok(out.trim() == "true")
    }

    async fn list_managed_stacks(&self) -> Result<Vec<ManagedStack>, EngineError> {
        let filter = format!("label={}={}", labels::MANAGER, constants::APP_NAME);
        let mut all_labels = Vec::new();

        let ids = self.container_ids(&filter).await?;
        all_labels.extend(self.container_labels(&ids).await?);

        if self.swarm_manager().await? {
            let out = self
                .run_plain(&["service", "ls", "--filter", &filter, "-q"])
                .await?;
            let service_ids = lines_of(&out);
            all_labels.extend(self.service_labels(&service_ids).await?);
        }

        let mut stacks: BTreeMap<String, ManagedStack> = BTreeMap::new();
        for label_set in all_labels {
            if let Some(name) = label_set.get(labels::DEPLOYMENT_NAME) {
                stacks.entry(name.clone()).or_insert_with(|| ManagedStack {
                    name: name.clone(),
                    labels: label_set.clone(),
                });
            }
        }
        Ok(stacks.into_values().collect())
    }

    async fn stack_labels(
        &self,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, EngineError> {
        if self.swarm_manager().await? {
            let out = self
                .run_plain(&[
                    "service",
                    "ls",
                    "--filter",
                    &format!("label={STACK_NAMESPACE_LABEL}={name}"),
                    "-q",
                ])
                .await?;
            let ids = lines_of(&out);
            return Ok(self.service_labels(&ids).await?.into_iter().next());
        }

        let ids = self
            .container_ids(&format!("label={COMPOSE_PROJECT_LABEL}={name}"))
            .await?;
        Ok(self.container_labels(&ids).await?.into_iter().next())
    }

    async fn service_images(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, String>, EngineError> {
        let mut images = BTreeMap::new();

        if self.swarm_manager().await? {
            let out = self
                .run_plain(&[
                    "service",
                    "ls",
                    "--filter",
                    &format!("label={STACK_NAMESPACE_LABEL}={name}"),
                    "-q",
                ])
                .await?;
            let ids = lines_of(&out);
            if ids.is_empty() {
                return Ok(images);
            }
            let mut args = vec!["service", "inspect", "--format", "{{json .Spec}}"];
            args.extend(ids.iter().map(String::as_str));
            let out = self.run_plain(&args).await?;
            for spec in parse_json_lines::<ServiceSpecLine>(&out) {
                let service = spec
                    .name
                    .strip_prefix(&format!("{name}_"))
                    .unwrap_or(&spec.name)
                    .to_string();
                images.insert(
                    service,
                    strip_digest(&spec.task_template.container_spec.image).to_string(),
                );
            }
            return Ok(images);
        }

        let ids = self
            .container_ids(&format!("label={COMPOSE_PROJECT_LABEL}={name}"))
            .await?;
        if ids.is_empty() {
            return Ok(images);
        }
        let mut args = vec!["inspect", "--format", "{{json .Config}}"];
        args.extend(ids.iter().map(String::as_str));
        let out = self.run_plain(&args).await?;
        for config in parse_json_lines::<ContainerConfigLine>(&out) {
            let service = config
                .labels
                .as_ref()
                .and_then(|l| l.get(COMPOSE_SERVICE_LABEL));
            if let Some(service) = service {
                images.insert(service.clone(), strip_digest(&config.image).to_string());
            }
        }
        Ok(images)
    }

    async fn apply(&self, plan: &DeployPlan) -> Result<(), EngineError> {
        if self.swarm_manager().await? {
            self.apply_swarm(plan).await
        } else {
            self.apply_standalone(plan).await
        }
    }

    async fn destroy(&self, name: &str, opts: &DestroyOptions) -> Result<(), EngineError> {
        if self.swarm_manager().await? {
            self.destroy_swarm(name, opts).await
        } else {
            self.destroy_standalone(name, opts).await
        }
    }

    async fn list_projects(&self, all: bool) -> Result<Vec<ProjectSummary>, EngineError> {
        let mut args = vec!["compose", "ls", "--format", "json"];
        if all {
            args.push("-a");
        }
        let out = self.run_plain(&args).await?;
        let projects: Vec<ComposeLsLine> =
            serde_json::from_str(out.trim()).map_err(|e| EngineError::Command(e.to_string()))?;
        Ok(projects
            .into_iter()
            .map(|p| ProjectSummary {
                name: p.name,
                status: p.status,
                config_files: p.config_files,
            })
            .collect())
    }

    async fn list_stacks(&self) -> Result<Vec<StackSummary>, EngineError> {
        let out = self
            .run_plain(&["stack", "ls", "--format", "{{json .}}"])
            .await?;
        Ok(parse_json_lines::<StackLsLine>(&out)
            .into_iter()
            .map(|s| StackSummary {
                name: s.name,
                services: s.services.parse().unwrap_or(0),
            })
            .collect())
    }

    async fn project_lifecycle(
        &self,
        name: &str,
        op: LifecycleOp,
        timeout: Option<u64>,
    ) -> Result<(), EngineError> {
        let ids = self
            .container_ids(&format!("label={COMPOSE_PROJECT_LABEL}={name}"))
            .await?;
        if ids.is_empty() {
            return Err(EngineError::NotFound(name.to_string()));
        }

        let timeout_arg = timeout.map(|t| t.to_string());
        let mut args = vec!["compose", "--project-name", name, op.as_str()];
        if let Some(timeout_arg) = &timeout_arg {
            // `start` takes no timeout
            if op != LifecycleOp::Start {
                args.push("-t");
                args.push(timeout_arg);
            }
        }
        self.run_plain(&args).await?;
        Ok(())
    }

    async fn scale_service(
        &self,
        stack: &str,
        service: &str,
        replicas: u64,
        wait: bool,
    ) -> Result<(), EngineError> {
        let target = format!("{stack}_{service}={replicas}");
        let mut args = vec!["service", "scale"];
        if !wait {
            args.push("--detach");
        }
        args.push(&target);
        self.run_plain(&args).await?;
        Ok(())
    }

    async fn restart_stack(&self, stack: &str) -> Result<(), EngineError> {
        let out = self
            .run_plain(&[
                "service",
                "ls",
                "--filter",
                &format!("label={STACK_NAMESPACE_LABEL}={stack}"),
                "--format",
                "{{.Name}}",
            ])
            .await?;
        let services = lines_of(&out);
        if services.is_empty() {
            return Err(EngineError::NotFound(stack.to_string()));
        }
        for service in services {
            self.run_plain(&["service", "update", "--force", "--detach", &service])
                .await?;
        }
        Ok(())
    }

    async fn run_stack_jobs(&self, stack: &str) -> Result<(), EngineError> {
        let out = self
            .run_plain(&[
                "service",
                "ls",
                "--filter",
                &format!("label={STACK_NAMESPACE_LABEL}={stack}"),
                "--format",
                "{{json .}}",
            ])
            .await?;
        let jobs: Vec<ServiceLine> = parse_json_lines(&out)
            .into_iter()
            .filter(|s: &ServiceLine| s.mode.contains("job"))
            .collect();
        if jobs.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no job-mode services in stack '{stack}'"
            )));
        }
        for job in jobs {
            self.run_plain(&["service", "update", "--force", "--detach", &job.name])
                .await?;
        }
        Ok(())
    }
}

// --- line formats ---

#[derive(Debug, Deserialize)]
struct ServiceLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Mode", default)]
    mode: String,
    #[serde(rename = "Replicas", default)]
    replicas: String,
}

#[derive(Debug, Deserialize)]
struct TaskLine {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Error", default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct ServiceSpecLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TaskTemplate")]
    task_template: TaskTemplateLine,
}

#[derive(Debug, Deserialize)]
struct TaskTemplateLine {
    #[serde(rename = "ContainerSpec")]
    container_spec: ContainerSpecLine,
}

#[derive(Debug, Deserialize)]
struct ContainerSpecLine {
    #[serde(rename = "Image", default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct ContainerConfigLine {
    #[serde(rename = "Image", default)]
    image: String,
    /// Null for containers created without labels
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ComposeLsLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "ConfigFiles", default)]
    config_files: String,
}

#[derive(Debug, Deserialize)]
struct StackLsLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Services", default)]
    services: String,
}

// --- pure helpers (unit-tested below) ---

fn lines_of(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn parse_json_lines<T: serde::de::DeserializeOwned>(output: &str) -> Vec<T> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

fn parse_label_lines(output: &str) -> Vec<BTreeMap<String, String>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "null")
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// `nginx:1.27@sha256:abc...` -> `nginx:1.27`
fn strip_digest(image: &str) -> &str {
    image.split('@').next().unwrap_or(image)
}

/// `1/1` and `2/2 (max 1 per node)` are converged; `0/1` is not.
fn replicas_converged(replicas: &str) -> bool {
    let head = replicas.split_whitespace().next().unwrap_or("");
    match head.split_once('/') {
        Some((current, desired)) => !current.is_empty() && current == desired,
        None => false,
    }
}

/// Classify a docker CLI failure into the error kinds the pipeline
/// distinguishes.
fn classify_failure(stderr: &str) -> EngineError {
    if stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
    {
        return EngineError::Connection(stderr.to_string());
    }
    if let Some(image) = extract_denied_image(stderr) {
        return EngineError::ImagePullAccessDenied(image);
    }
    EngineError::Command(stderr.to_string())
}

fn extract_denied_image(stderr: &str) -> Option<String> {
    let patterns = [
        regex::Regex::new(r"pull access denied for ([^\s,]+)").expect("static regex"),
        regex::Regex::new(r"No such image: ([^\s]+)").expect("static regex"),
    ];
    for pattern in &patterns {
        if let Some(captures) = pattern.captures(stderr) {
            return Some(strip_digest(&captures[1]).to_string());
        }
    }
    None
}

/// Override document carrying only labels, merged last so every service and
/// declared volume of the project gets the managed-resource label set.
fn label_override(project: &ComposeProject, label_set: &BTreeMap<String, String>) -> Value {
    let labels_value = labels_mapping(label_set);

    let mut services = Mapping::new();
    for name in project.service_names() {
        let mut service = Mapping::new();
        service.insert(Value::String("labels".into()), labels_value.clone());
        services.insert(Value::String(name), Value::Mapping(service));
    }

    let mut root = Mapping::new();
    root.insert(Value::String("services".into()), Value::Mapping(services));

    if let Some(volumes) = project.doc().get("volumes").and_then(Value::as_mapping) {
        let mut labeled_volumes = Mapping::new();
        for key in volumes.keys() {
            let mut volume = Mapping::new();
            volume.insert(Value::String("labels".into()), labels_value.clone());
            labeled_volumes.insert(key.clone(), Value::Mapping(volume));
        }
        root.insert(Value::String("volumes".into()), Value::Mapping(labeled_volumes));
    }

    Value::Mapping(root)
}

fn labels_mapping(label_set: &BTreeMap<String, String>) -> Value {
    let mut mapping = Mapping::new();
    for (key, value) in label_set {
        mapping.insert(
            Value::String(key.clone()),
            Value::String(value.clone()),
        );
    }
    Value::Mapping(mapping)
}

/// Recursively interpolate every string scalar in a document.
fn interpolate_doc(value: Value, env: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(&s, env)),
        Value::Sequence(seq) => {
            Value::Sequence(seq.into_iter().map(|v| interpolate_doc(v, env)).collect())
        }
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_doc(v, env)))
                .collect(),
        ),
        other => other,
    }
}

/// Attach managed-resource labels to services (deploy + container level)
/// and declared volumes of a swarm document.
fn attach_swarm_labels(doc: &mut Value, label_set: &BTreeMap<String, String>) {
    let labels_value = labels_mapping(label_set);

    if let Some(services) = doc.get_mut("services").and_then(Value::as_mapping_mut) {
        for service in services.values_mut() {
            let Some(service) = service.as_mapping_mut() else {
                continue;
            };
            merge_labels(service, "labels", &labels_value);
            let deploy = service
                .entry(Value::String("deploy".into()))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if let Some(deploy) = deploy.as_mapping_mut() {
                merge_labels(deploy, "labels", &labels_value);
            }
        }
    }

    if let Some(volumes) = doc.get_mut("volumes").and_then(Value::as_mapping_mut) {
        for volume in volumes.values_mut() {
            if volume.is_null() {
                *volume = Value::Mapping(Mapping::new());
            }
            if let Some(volume) = volume.as_mapping_mut() {
                merge_labels(volume, "labels", &labels_value);
            }
        }
    }
}

fn merge_labels(target: &mut Mapping, key: &str, labels_value: &Value) {
    let slot = target
        .entry(Value::String(key.into()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    match slot {
        Value::Mapping(existing) => {
            if let Value::Mapping(labels) = labels_value {
                for (k, v) in labels {
                    existing.insert(k.clone(), v.clone());
                }
            }
        }
        // List syntax (`- key=value`); append ours
        Value::Sequence(existing) => {
            if let Value::Mapping(labels) = labels_value {
                for (k, v) in labels {
                    if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                        existing.push(Value::String(format!("{k}={v}")));
                    }
                }
            }
        }
        other => *other = labels_value.clone(),
    }
}

/// Swarm refuses to update configs and secrets in place, so append a short
/// content hash to every file-backed definition and rewrite the service
/// references. Content changes then create new objects and trigger task
/// restarts naturally.
fn suffix_content_names(doc: &mut Value, working_dir: &Path) -> anyhow::Result<()> {
    for section in ["configs", "secrets"] {
        let mut renames: Vec<(String, String)> = Vec::new();

        if let Some(entries) = doc.get_mut(section).and_then(Value::as_mapping_mut) {
            let keys: Vec<Value> = entries.keys().cloned().collect();
            for key in keys {
                let Some(key_str) = key.as_str().map(String::from) else {
                    continue;
                };
                let Some(entry) = entries.get(&key) else {
                    continue;
                };
                let Some(file) = entry.get("file").and_then(Value::as_str) else {
                    continue;
                };
                let file_path = if Path::new(file).is_absolute() {
                    PathBuf::from(file)
                } else {
                    working_dir.join(file)
                };
                let content = std::fs::read(&file_path).map_err(|e| {
                    anyhow::anyhow!("failed to read {section} file {}: {e}", file_path.display())
                })?;
                let digest = Sha256::digest(&content);
                let suffix = hex::encode(&digest[..4]);
                let new_key = format!("{key_str}-{suffix}");

                let mut entry = entries
                    .remove(&key)
                    .expect("key taken from the same mapping");
                if let Some(entry_map) = entry.as_mapping_mut() {
                    if let Some(name) = entry_map.get_mut(Value::String("name".into())) {
                        if let Some(name_str) = name.as_str() {
                            *name = Value::String(format!("{name_str}-{suffix}"));
                        }
                    }
                }
                entries.insert(Value::String(new_key.clone()), entry);
                renames.push((key_str, new_key));
            }
        }

        if renames.is_empty() {
            continue;
        }
        let renames: BTreeMap<String, String> = renames.into_iter().collect();

        if let Some(services) = doc.get_mut("services").and_then(Value::as_mapping_mut) {
            for service in services.values_mut() {
                let Some(refs) = service.get_mut(section).and_then(Value::as_sequence_mut)
                else {
                    continue;
                };
                for reference in refs {
                    match reference {
                        Value::String(source) => {
                            if let Some(new_key) = renames.get(source.as_str()) {
                                *source = new_key.clone();
                            }
                        }
                        Value::Mapping(long) => {
                            if let Some(source) =
                                long.get_mut(Value::String("source".into()))
                            {
                                if let Some(new_key) =
                                    source.as_str().and_then(|s| renames.get(s))
                                {
                                    *source = Value::String(new_key.clone());
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    Ok(())
}

/// Write a rendered YAML document next to the project so relative paths
/// keep resolving. The temp file is removed when the handle drops.
fn write_rendered_file(
    working_dir: &Path,
    doc: &Value,
) -> Result<tempfile::NamedTempFile, EngineError> {
    let rendered = serde_yaml::to_string(doc).map_err(|e| EngineError::Command(e.to_string()))?;
    let file = tempfile::Builder::new()
        .prefix(".doco-cd-rendered-")
        .suffix(".yaml")
        .tempfile_in(working_dir)
        .map_err(|e| EngineError::Command(format!("failed to create rendered file: {e}")))?;
    std::fs::write(file.path(), rendered)
        .map_err(|e| EngineError::Command(format!("failed to write rendered file: {e}")))?;
    Ok(file)
}
