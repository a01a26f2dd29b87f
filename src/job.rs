//! # Jobs
//!
//! One job per inbound trigger. The job id is a time-ordered UUID (v7) that
//! appears in every log line, response body, and notification for the run.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::webhook::ParsedPayload;

/// What caused a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Webhook,
    Poll,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
        }
    }
}

/// A single reconciliation run for one repository at one reference.
#[derive(Debug, Clone)]
pub struct Job {
    /// Time-ordered unique identifier
    pub job_id: String,
    pub trigger: Trigger,
    /// Normalized repository name derived from the clone URL
    pub repository_name: String,
    /// Branch, tag, or SHA to reconcile
    pub reference: String,
    /// Commit known at admission; resolved from the checkout otherwise
    pub commit_sha: Option<String>,
    /// Deploy-config variant selector
    pub custom_target: Option<String>,
    /// Normalized trigger payload
    pub payload: ParsedPayload,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl Job {
    pub fn new(
        trigger: Trigger,
        repository_name: String,
        payload: ParsedPayload,
        custom_target: Option<String>,
    ) -> Self {
        let commit_sha = if payload.commit_sha.is_empty() {
            None
        } else {
            Some(payload.commit_sha.clone())
        };
        Self {
            job_id: uuid::Uuid::now_v7().to_string(),
            trigger,
            repository_name,
            reference: payload.reference.clone(),
            commit_sha,
            custom_target,
            payload,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Wall-clock time since the job was admitted.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ParsedPayload {
        ParsedPayload {
            reference: "refs/heads/main".to_string(),
            ref_type: "branch".to_string(),
            before: String::new(),
            after: "abc123".to_string(),
            commit_sha: "abc123".to_string(),
            name: "shop".to_string(),
            full_name: "acme/shop".to_string(),
            clone_url: "https://github.com/acme/shop.git".to_string(),
            ssh_url: "git@github.com:acme/shop.git".to_string(),
            web_url: "https://github.com/acme/shop".to_string(),
            private: false,
        }
    }

    #[test]
    fn test_job_ids_are_unique_and_time_ordered() {
        let a = Job::new(Trigger::Webhook, "r".into(), payload(), None);
        let b = Job::new(Trigger::Webhook, "r".into(), payload(), None);
        assert_ne!(a.job_id, b.job_id);
        // UUIDv7 sorts by creation time lexicographically
        assert!(a.job_id < b.job_id);
    }

    #[test]
    fn test_commit_sha_empty_means_unresolved() {
        let mut p = payload();
        p.commit_sha = String::new();
        let job = Job::new(Trigger::Poll, "r".into(), p, None);
        assert_eq!(job.commit_sha, None);
    }
}
