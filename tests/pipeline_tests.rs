//! End-to-end pipeline tests against a recording engine double and real
//! local git repositories. Covers the stack state machine, change
//! detection, loop escape, destroy semantics, ownership conflicts, and the
//! auto-discovery reaper.

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{commit_files, commit_removal, init_upstream, managed_labels, test_config, MockEngine};
use doco_cd::config::DeployConfig;
use doco_cd::constants::labels;
use doco_cd::errors::JobError;
use doco_cd::job::{Job, Trigger};
use doco_cd::reconciler::Reconciler;
use doco_cd::secrets::EnvResolver;
use doco_cd::webhook::ParsedPayload;

const COMPOSE: &str = "services:\n  web:\n    image: nginx:1.27\n";

struct Harness {
    _upstream: tempfile::TempDir,
    _data: tempfile::TempDir,
    pub upstream_path: std::path::PathBuf,
    pub engine: Arc<MockEngine>,
    pub reconciler: Reconciler,
}

fn harness(files: &[(&str, &str)]) -> Harness {
    let upstream = tempfile::tempdir().unwrap();
    init_upstream(upstream.path(), files);
    let data = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let reconciler = Reconciler::new(
        test_config(data.path()),
        Arc::clone(&engine) as Arc<dyn doco_cd::engine::ContainerEngine>,
        Arc::new(EnvResolver),
        CancellationToken::new(),
    );
    Harness {
        upstream_path: upstream.path().to_path_buf(),
        _upstream: upstream,
        _data: data,
        engine,
        reconciler,
    }
}

impl Harness {
    fn clone_url(&self) -> String {
        self.upstream_path.to_string_lossy().to_string()
    }

    fn job(&self) -> Job {
        let clone_url = self.clone_url();
        Job::new(
            Trigger::Webhook,
            "github.com/acme/shop".to_string(),
            ParsedPayload {
                reference: "main".to_string(),
                ref_type: "branch".to_string(),
                before: String::new(),
                after: "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba".to_string(),
                commit_sha: "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba".to_string(),
                name: "shop".to_string(),
                full_name: "acme/shop".to_string(),
                clone_url,
                ssh_url: String::new(),
                web_url: String::new(),
                private: false,
            },
            None,
        )
    }
}

#[tokio::test]
async fn test_fresh_deploy_attaches_managed_labels() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\n"),
    ]);

    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.deployed, vec!["web"]);
    assert!(outcome.skipped.is_empty());

    let plan = h.engine.last_applied().unwrap();
    assert_eq!(plan.name, "web");
    assert_eq!(plan.labels[labels::MANAGER], "doco-cd");
    assert_eq!(plan.labels[labels::DEPLOYMENT_NAME], "web");
    assert_eq!(plan.labels[labels::TARGET_REF], "main");
    assert_eq!(plan.labels[labels::COMMIT_SHA], outcome.commit);
    assert_eq!(plan.labels[labels::REPOSITORY_NAME], "acme/shop");
    assert!(!plan.force_recreate);
}

#[tokio::test]
async fn test_no_change_run_is_idempotent() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\n"),
    ]);

    h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(h.engine.applied_count(), 1);

    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.skipped, vec!["web"]);
    // No engine writes on the second run
    assert_eq!(h.engine.applied_count(), 1);
}

#[tokio::test]
async fn test_irrelevant_commit_skips_relevant_commit_deploys() {
    let h = harness(&[
        ("services/shop/compose.yaml", COMPOSE),
        ("docs/README.md", "readme\n"),
        (
            ".doco-cd/config.yaml",
            "name: web\nworking_dir: services/shop\n",
        ),
    ]);

    h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(h.engine.applied_count(), 1);

    commit_files(&h.upstream_path, &[("docs/README.md", "changed\n")], "docs");
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.skipped, vec!["web"]);
    assert_eq!(h.engine.applied_count(), 1);

    commit_files(
        &h.upstream_path,
        &[(
            "services/shop/compose.yaml",
            "services:\n  web:\n    image: nginx:1.28\n",
        )],
        "bump image",
    );
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.deployed, vec!["web"]);
    assert_eq!(h.engine.applied_count(), 2);
}

#[tokio::test]
async fn test_loop_escape_forces_recreate_on_third_trigger() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\n"),
    ]);

    // First trigger deploys fresh, second skips as "no changes"
    h.reconciler.run_job(&h.job(), None).await.unwrap();
    let second = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(second.skipped, vec!["web"]);
    assert_eq!(h.engine.applied_count(), 1);

    // Third consecutive trigger at the same commit escapes the loop
    let third = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(third.deployed, vec!["web"]);
    let plan = h.engine.last_applied().unwrap();
    assert!(plan.force_recreate);
}

#[tokio::test]
async fn test_secret_drift_triggers_redeploy_without_commit_change() {
    std::env::set_var("PIPELINE_TEST_SECRET", "v1");
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (
            ".doco-cd/config.yaml",
            "name: web\nexternal_secrets:\n  APP_SECRET: env://PIPELINE_TEST_SECRET\n",
        ),
    ]);

    h.reconciler.run_job(&h.job(), None).await.unwrap();
    let first_hash = h.engine.last_applied().unwrap().labels[labels::EXTERNAL_SECRETS_HASH].clone();
    assert!(!first_hash.is_empty());

    // Same commit, changed material
    std::env::set_var("PIPELINE_TEST_SECRET", "v2");
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.deployed, vec!["web"]);
    let second_hash =
        h.engine.last_applied().unwrap().labels[labels::EXTERNAL_SECRETS_HASH].clone();
    assert_ne!(first_hash, second_hash);
    std::env::remove_var("PIPELINE_TEST_SECRET");
}

#[tokio::test]
async fn test_image_drift_forces_redeploy() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\n"),
    ]);

    h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(h.engine.applied_count(), 1);

    // Someone retagged the running service behind the daemon's back
    h.engine
        .state
        .lock()
        .unwrap()
        .images
        .insert("web".into(), [("web".to_string(), "nginx:1.0".to_string())].into());

    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.deployed, vec!["web"]);
    assert_eq!(h.engine.applied_count(), 2);
}

#[tokio::test]
async fn test_foreign_owner_is_never_overwritten() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\n"),
    ]);
    let mut foreign = managed_labels("web", "abc", "other/repo", "https://example.com/other.git");
    foreign.insert(labels::REPOSITORY_NAME.to_string(), "other/repo".to_string());
    h.engine.seed_stack("web", foreign);

    let result = h.reconciler.run_job(&h.job(), None).await;
    match result {
        Err(JobError::DeploymentConflict { name, owner }) => {
            assert_eq!(name, "web");
            assert_eq!(owner, "other/repo");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(h.engine.applied_count(), 0);
    assert!(h.engine.destroyed().is_empty());
}

#[tokio::test]
async fn test_destroy_lifecycle() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\ndestroy: true\n"),
    ]);

    // Absent + destroy=true is a no-op, not an error
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.skipped, vec!["web"]);
    assert!(h.engine.destroyed().is_empty());

    // Present + destroy=true tears the stack down
    h.engine.seed_stack(
        "web",
        managed_labels("web", "abc", "acme/shop", &h.clone_url()),
    );
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.destroyed, vec!["web"]);
    assert_eq!(h.engine.destroyed(), vec!["web"]);
}

#[tokio::test]
async fn test_destroy_refuses_unmanaged_stack() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\ndestroy: true\n"),
    ]);
    let mut unmanaged = managed_labels("web", "abc", "acme/shop", &h.clone_url());
    unmanaged.remove(labels::MANAGER);
    h.engine.seed_stack("web", unmanaged);

    let result = h.reconciler.run_job(&h.job(), None).await;
    assert!(matches!(result, Err(JobError::NotManaged(_))));
    assert!(h.engine.destroyed().is_empty());
}

#[tokio::test]
async fn test_auto_discover_deploys_and_reaps_orphans() {
    let h = harness(&[
        ("services/web/compose.yaml", COMPOSE),
        ("services/api/compose.yaml", COMPOSE),
        (
            ".doco-cd/config.yaml",
            "name: fanout\nworking_dir: services\nauto_discover: true\n",
        ),
    ]);

    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    let mut deployed = outcome.deployed.clone();
    deployed.sort();
    assert_eq!(deployed, vec!["api", "web"]);

    // The api directory disappears upstream; its stack must be reaped
    commit_removal(&h.upstream_path, "services/api", "drop api");
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.destroyed, vec!["api"]);
    assert!(h.engine.destroyed().contains(&"api".to_string()));
    // web is intact
    assert!(h
        .engine
        .state
        .lock()
        .unwrap()
        .stacks
        .contains_key("web"));
}

#[tokio::test]
async fn test_reap_respects_delete_opt_out() {
    let h = harness(&[
        ("services/web/compose.yaml", COMPOSE),
        (
            ".doco-cd/config.yaml",
            "name: fanout\nworking_dir: services\nauto_discover: true\n",
        ),
    ]);

    let mut kept = managed_labels("legacy", "abc", "acme/shop", &h.clone_url());
    kept.insert(labels::AUTO_DISCOVER.to_string(), "true".to_string());
    kept.insert(labels::AUTO_DISCOVER_DELETE.to_string(), "false".to_string());
    kept.insert(labels::WORKING_DIR.to_string(), "services/legacy".to_string());
    h.engine.seed_stack("legacy", kept);

    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.deployed, vec!["web"]);
    assert!(outcome.destroyed.is_empty());
    assert!(h
        .engine
        .state
        .lock()
        .unwrap()
        .stacks
        .contains_key("legacy"));
}

#[tokio::test]
async fn test_destroy_then_redeploy_restores_same_label_identity() {
    let h = harness(&[
        ("compose.yaml", COMPOSE),
        (".doco-cd/config.yaml", "name: web\n"),
    ]);

    h.reconciler.run_job(&h.job(), None).await.unwrap();
    let first = h.engine.last_applied().unwrap();

    // Flip to destroy, then back to deploy
    commit_files(
        &h.upstream_path,
        &[(".doco-cd/config.yaml", "name: web\ndestroy: true\n")],
        "destroy",
    );
    h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert!(h.engine.destroyed().contains(&"web".to_string()));

    commit_files(
        &h.upstream_path,
        &[(".doco-cd/config.yaml", "name: web\n")],
        "revive",
    );
    let outcome = h.reconciler.run_job(&h.job(), None).await.unwrap();
    assert_eq!(outcome.deployed, vec!["web"]);
    let second = h.engine.last_applied().unwrap();
    assert_eq!(
        first.labels[labels::DEPLOYMENT_NAME],
        second.labels[labels::DEPLOYMENT_NAME]
    );
    assert_eq!(first.name, second.name);
}

#[tokio::test]
async fn test_missing_token_for_private_repo() {
    let h = harness(&[("compose.yaml", COMPOSE)]);
    let mut job = h.job();
    job.payload.private = true;

    let result = h.reconciler.run_job(&job, None).await;
    assert!(matches!(result, Err(JobError::MissingAccessToken)));
}
