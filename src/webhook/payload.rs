//! # Payload Normalization
//!
//! Raw provider payload schemas and their conversion into the one
//! [`ParsedPayload`] shape the rest of the daemon works with.

use serde::{Deserialize, Serialize};

use crate::constants::ZERO_SHA;
use crate::errors::JobError;

/// Provider-independent push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedPayload {
    /// Git ref as delivered, e.g. `refs/heads/main`
    pub reference: String,
    /// `branch` or `tag`
    pub ref_type: String,
    pub before: String,
    pub after: String,
    /// Commit that triggered the job; empty when the provider sent none
    pub commit_sha: String,
    /// Repository short name
    pub name: String,
    /// `owner/name`
    pub full_name: String,
    pub clone_url: String,
    pub ssh_url: String,
    pub web_url: String,
    pub private: bool,
}

/// Parse result carrying the deletion verdict alongside the payload, so the
/// gate does not need provider-specific fields again.
pub(crate) struct NormalizedEvent {
    pub payload: ParsedPayload,
    pub deletion: bool,
}

fn ref_type_of(reference: &str) -> &'static str {
    if reference.starts_with("refs/tags/") {
        "tag"
    } else {
        "branch"
    }
}

// --- GitHub / Gitea / Gogs / Forgejo (identical push schema) ---

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref", default)]
    reference: String,
    /// Only present on `delete` (and `create`) events
    #[serde(default)]
    ref_type: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
    repository: PushRepository,
    #[serde(default)]
    head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    name: String,
    full_name: String,
    clone_url: String,
    #[serde(default)]
    ssh_url: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    id: String,
}

/// `event` is the value of the provider's event header (`push` / `delete`).
pub(crate) fn parse_push_family(event: &str, body: &[u8]) -> Result<NormalizedEvent, JobError> {
    if event != "push" && event != "delete" {
        return Err(JobError::ParsingPayload(format!(
            "unsupported event type '{event}'"
        )));
    }

    let raw: PushEvent = serde_json::from_slice(body)
        .map_err(|e| JobError::ParsingPayload(e.to_string()))?;

    let deletion = (event == "delete" && matches!(raw.ref_type.as_str(), "branch" | "tag"))
        || (raw.before != ZERO_SHA && raw.after == ZERO_SHA);

    let commit_sha = if !raw.after.is_empty() && raw.after != ZERO_SHA {
        raw.after.clone()
    } else {
        raw.head_commit.as_ref().map(|c| c.id.clone()).unwrap_or_default()
    };

    let ref_type = if raw.ref_type.is_empty() {
        ref_type_of(&raw.reference).to_string()
    } else {
        raw.ref_type.clone()
    };

    Ok(NormalizedEvent {
        payload: ParsedPayload {
            reference: raw.reference,
            ref_type,
            before: raw.before,
            after: raw.after,
            commit_sha,
            name: raw.repository.name,
            full_name: raw.repository.full_name,
            clone_url: raw.repository.clone_url,
            ssh_url: raw.repository.ssh_url,
            web_url: raw.repository.html_url,
            private: raw.repository.private,
        },
        deletion,
    })
}

// --- GitLab (distinct schema) ---

#[derive(Debug, Deserialize)]
struct GitlabPushEvent {
    #[serde(default)]
    object_kind: String,
    #[serde(rename = "ref", default)]
    reference: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
    #[serde(default)]
    checkout_sha: Option<String>,
    project: GitlabProject,
}

#[derive(Debug, Deserialize)]
struct GitlabProject {
    name: String,
    path_with_namespace: String,
    git_http_url: String,
    #[serde(default)]
    git_ssh_url: String,
    #[serde(default)]
    web_url: String,
    /// 0 private, 10 internal, 20 public
    #[serde(default)]
    visibility_level: i64,
}

pub(crate) fn parse_gitlab(body: &[u8]) -> Result<NormalizedEvent, JobError> {
    let raw: GitlabPushEvent = serde_json::from_slice(body)
        .map_err(|e| JobError::ParsingPayload(e.to_string()))?;

    if raw.object_kind != "push" && raw.object_kind != "tag_push" {
        return Err(JobError::ParsingPayload(format!(
            "unsupported event type '{}'",
            raw.object_kind
        )));
    }

    let checkout_sha = raw.checkout_sha.clone().unwrap_or_default();
    let deletion = raw.after == ZERO_SHA && checkout_sha.is_empty();

    let commit_sha = if !checkout_sha.is_empty() {
        checkout_sha
    } else if raw.after != ZERO_SHA {
        raw.after.clone()
    } else {
        String::new()
    };

    Ok(NormalizedEvent {
        payload: ParsedPayload {
            ref_type: ref_type_of(&raw.reference).to_string(),
            reference: raw.reference,
            before: raw.before,
            after: raw.after,
            commit_sha,
            name: raw.project.name,
            full_name: raw.project.path_with_namespace,
            clone_url: raw.project.git_http_url,
            ssh_url: raw.project.git_ssh_url,
            web_url: raw.project.web_url,
            private: raw.project.visibility_level < 20,
        },
        deletion,
    })
}
