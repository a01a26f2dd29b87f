//! # Poll Scheduler
//!
//! Interval-driven reconciliation for hosts that cannot receive webhooks.
//! Every poll config runs its own loop; a tick that finds the repository
//! lock held by another job is skipped, never queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::config::PollConfig;
use crate::errors::JobError;
use crate::job::{Job, Trigger};
use crate::observability::metrics;
use crate::reconciler::{JobOutcome, Reconciler};
use crate::repo;
use crate::webhook::ParsedPayload;

/// Spawn one loop per poll config and wait for all of them. Loops exit on
/// shutdown or, for `run_once` entries, after their first tick.
pub async fn run_poll_loops(reconciler: Arc<Reconciler>, configs: Vec<PollConfig>) {
    let mut handles = Vec::new();
    for config in configs {
        let reconciler = Arc::clone(&reconciler);
        handles.push(tokio::spawn(poll_loop(reconciler, config)));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn poll_loop(reconciler: Arc<Reconciler>, config: PollConfig) {
    let cancel = reconciler.cancel_token();
    let interval = Duration::from_secs(config.interval);
    info!(
        url = config.url,
        reference = config.reference,
        interval_secs = config.interval,
        run_once = config.run_once,
        "poll loop started"
    );

    loop {
        let started = Instant::now();
        match run_poll_tick(&reconciler, &config).await {
            Ok(Some(outcome)) => {
                metrics::increment_poll_total();
                metrics::observe_poll_duration(started.elapsed().as_secs_f64());
                info!(url = config.url, summary = outcome.summary(), "poll run finished");
            }
            Ok(None) => {}
            Err(e) => {
                metrics::increment_poll_errors();
                error!(url = config.url, kind = e.kind(), error = %e, "poll run failed");
            }
        }

        if config.run_once {
            info!(url = config.url, "run-once poll finished, loop exiting");
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => return,
        }
    }
}

/// One tick: acquire the repository lock non-blockingly, run the pipeline,
/// release. `Ok(None)` means the tick was skipped because another job holds
/// the repository.
async fn run_poll_tick(
    reconciler: &Reconciler,
    config: &PollConfig,
) -> Result<Option<JobOutcome>, JobError> {
    let repo_name = repo::normalize_repo_name(&config.url)?;
    let payload = synthetic_payload(config, &repo_name);
    let job = Job::new(
        Trigger::Poll,
        repo_name.clone(),
        payload,
        config.custom_target.clone(),
    );

    let lock = reconciler.locks.get(&repo_name);
    if !lock.try_lock(&job.job_id) {
        info!(
            repository = repo_name,
            holder = lock.holder().as_deref().unwrap_or(""),
            "another job in progress, skipping poll tick"
        );
        return Ok(None);
    }

    let result = reconciler
        .run_job(&job, Some(config.deployments.clone()))
        .await;
    lock.unlock();
    result.map(Some)
}

/// Poll jobs carry a synthetic payload: the trigger commit is the literal
/// string `poll`, everything else derives from the poll config.
fn synthetic_payload(config: &PollConfig, repo_name: &str) -> ParsedPayload {
    let full_name = repo_name
        .split_once('/')
        .map(|(_, path)| path.to_string())
        .unwrap_or_else(|| repo_name.to_string());
    ParsedPayload {
        reference: config.reference.clone(),
        ref_type: "branch".to_string(),
        before: String::new(),
        after: String::new(),
        commit_sha: crate::constants::POLL_TRIGGER.to_string(),
        name: repo::short_name(repo_name).to_string(),
        full_name,
        clone_url: config.url.clone(),
        ssh_url: if config.url.starts_with("git@") || config.url.starts_with("ssh://") {
            config.url.clone()
        } else {
            String::new()
        },
        web_url: String::new(),
        private: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_payload_shape() {
        let config: PollConfig =
            serde_yaml::from_str("url: https://github.com/acme/shop.git\nreference: production")
                .unwrap();
        let payload = synthetic_payload(&config, "github.com/acme/shop");
        assert_eq!(payload.commit_sha, "poll");
        assert_eq!(payload.reference, "production");
        assert_eq!(payload.full_name, "acme/shop");
        assert_eq!(payload.name, "shop");
        assert!(payload.ssh_url.is_empty());
    }

    #[test]
    fn test_synthetic_payload_ssh_url() {
        let config: PollConfig =
            serde_yaml::from_str("url: git@github.com:acme/shop.git").unwrap();
        let payload = synthetic_payload(&config, "github.com/acme/shop");
        assert_eq!(payload.ssh_url, "git@github.com:acme/shop.git");
    }
}
