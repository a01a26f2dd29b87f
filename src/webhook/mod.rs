//! # Webhook Decoder
//!
//! Turns an inbound SCM webhook into a normalized push event:
//!
//! 1. Detect the provider from its event header
//! 2. Verify the request (HMAC-SHA256 or token equality)
//! 3. Parse and normalize the payload
//! 4. Gate out branch/tag deletion events (intentional skip)
//! 5. Reject path-traversal in the repository full name
//!
//! Method enforcement and the body size cap happen in the HTTP layer before
//! this module sees the request.

mod payload;

pub use payload::ParsedPayload;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::JobError;

type HmacSha256 = Hmac<Sha256>;

/// Supported SCM providers. GitHub, Gitea, Gogs and Forgejo share one push
/// schema; GitLab has its own schema and token-based auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    Gitea,
    Gogs,
    Forgejo,
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Gitea => "gitea",
            Self::Gogs => "gogs",
            Self::Forgejo => "forgejo",
            Self::GitLab => "gitlab",
        }
    }

    fn event_header(&self) -> &'static str {
        match self {
            Self::GitHub => "x-github-event",
            Self::Gitea => "x-gitea-event",
            Self::Gogs => "x-gogs-event",
            Self::Forgejo => "x-forgejo-event",
            Self::GitLab => "x-gitlab-event",
        }
    }

    fn signature_header(&self) -> &'static str {
        match self {
            Self::GitHub => "x-hub-signature-256",
            Self::Gitea => "x-gitea-signature",
            Self::Gogs => "x-gogs-signature",
            Self::Forgejo => "x-forgejo-signature",
            Self::GitLab => "x-gitlab-token",
        }
    }
}

/// Detection order matters: Forgejo and Gitea replay the GitHub event header
/// for compatibility, so the most specific header wins.
const DETECTION_ORDER: [Provider; 5] = [
    Provider::GitLab,
    Provider::Forgejo,
    Provider::Gitea,
    Provider::Gogs,
    Provider::GitHub,
];

/// Identify the provider from the first matching event header.
pub fn detect_provider(headers: &HeaderMap) -> Result<Provider, JobError> {
    DETECTION_ORDER
        .into_iter()
        .find(|p| headers.contains_key(p.event_header()))
        .ok_or(JobError::UnknownProvider)
}

/// Verify request authenticity for `provider`.
///
/// GitHub-family providers sign the body with HMAC-SHA256; GitLab sends the
/// shared token verbatim. Both comparisons are constant-time.
pub fn verify(
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<(), JobError> {
    let header_value = headers
        .get(provider.signature_header())
        .and_then(|v| v.to_str().ok())
        .ok_or(JobError::MissingSecurityHeader)?;

    match provider {
        Provider::GitLab => {
            if constant_time_eq(header_value.as_bytes(), secret.as_bytes()) {
                Ok(())
            } else {
                Err(JobError::GitlabTokenVerificationFailed)
            }
        }
        Provider::GitHub => {
            let hex_digest = header_value
                .strip_prefix("sha256=")
                .ok_or(JobError::HmacVerificationFailed)?;
            verify_hmac(hex_digest, body, secret)
        }
        // Hex digest without the sha256= prefix
        Provider::Gitea | Provider::Gogs | Provider::Forgejo => {
            verify_hmac(header_value, body, secret)
        }
    }
}

fn verify_hmac(hex_digest: &str, body: &[u8], secret: &str) -> Result<(), JobError> {
    let expected = hex::decode(hex_digest).map_err(|_| JobError::HmacVerificationFailed)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| JobError::HmacVerificationFailed)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| JobError::HmacVerificationFailed)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Full decode: detect, verify, parse, gate.
///
/// Returns [`JobError::DeletionEvent`] for branch/tag deletions; the caller
/// maps that to a 202 skip rather than a failure.
pub fn decode(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<(Provider, ParsedPayload), JobError> {
    let provider = detect_provider(headers)?;
    verify(provider, headers, body, secret)?;

    let event = headers
        .get(provider.event_header())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let normalized = match provider {
        Provider::GitLab => payload::parse_gitlab(body)?,
        _ => payload::parse_push_family(event, body)?,
    };

    if normalized.deletion {
        return Err(JobError::DeletionEvent);
    }

    if normalized.payload.full_name.contains("..") {
        return Err(JobError::InvalidRepoName(normalized.payload.full_name));
    }

    Ok((provider, normalized.payload))
}

/// Sign `body` the way a provider would. Used by tests and by the fixture
/// generator; kept here so signing and verification share one code path.
pub fn sign(provider: Provider, body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    let digest = hex::encode(mac.finalize().into_bytes());
    match provider {
        Provider::GitHub => format!("sha256={digest}"),
        _ => digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ZERO_SHA;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-webhook-secret";

    const GITHUB_PUSH: &str = r#"{
        "ref": "refs/heads/main",
        "before": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
        "after": "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba",
        "repository": {
            "name": "shop",
            "full_name": "acme/shop",
            "clone_url": "https://github.com/acme/shop.git",
            "ssh_url": "git@github.com:acme/shop.git",
            "html_url": "https://github.com/acme/shop",
            "private": true
        },
        "head_commit": {"id": "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba"}
    }"#;

    const GITLAB_PUSH: &str = r#"{
        "object_kind": "push",
        "ref": "refs/heads/main",
        "before": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
        "after": "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba",
        "checkout_sha": "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba",
        "project": {
            "name": "shop",
            "path_with_namespace": "acme/shop",
            "git_http_url": "https://gitlab.com/acme/shop.git",
            "git_ssh_url": "git@gitlab.com:acme/shop.git",
            "web_url": "https://gitlab.com/acme/shop",
            "visibility_level": 0
        }
    }"#;

    fn signed_headers(provider: Provider, event: &str, body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            provider.event_header(),
            HeaderValue::from_str(event).unwrap(),
        );
        let signature = match provider {
            Provider::GitLab => SECRET.to_string(),
            _ => sign(provider, body.as_bytes(), SECRET),
        };
        headers.insert(
            provider.signature_header(),
            HeaderValue::from_str(&signature).unwrap(),
        );
        headers
    }

    #[test]
    fn test_hmac_roundtrip_all_push_family_providers() {
        for provider in [
            Provider::GitHub,
            Provider::Gitea,
            Provider::Gogs,
            Provider::Forgejo,
        ] {
            let headers = signed_headers(provider, "push", GITHUB_PUSH);
            let (detected, payload) =
                decode(&headers, GITHUB_PUSH.as_bytes(), SECRET).unwrap();
            assert_eq!(detected, provider);
            assert_eq!(payload.full_name, "acme/shop");
            assert_eq!(payload.reference, "refs/heads/main");
            assert_eq!(payload.ref_type, "branch");
            assert_eq!(
                payload.commit_sha,
                "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba"
            );
            assert!(payload.private);
        }
    }

    #[test]
    fn test_gitlab_token_roundtrip() {
        let headers = signed_headers(Provider::GitLab, "Push Hook", GITLAB_PUSH);
        let (provider, payload) = decode(&headers, GITLAB_PUSH.as_bytes(), SECRET).unwrap();
        assert_eq!(provider, Provider::GitLab);
        assert_eq!(payload.full_name, "acme/shop");
        assert_eq!(payload.clone_url, "https://gitlab.com/acme/shop.git");
        assert!(payload.private);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let headers = signed_headers(Provider::GitHub, "push", GITHUB_PUSH);
        let result = decode(&headers, GITHUB_PUSH.as_bytes(), "other-secret");
        assert!(matches!(result, Err(JobError::HmacVerificationFailed)));
    }

    #[test]
    fn test_wrong_gitlab_token_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", HeaderValue::from_static("Push Hook"));
        headers.insert("x-gitlab-token", HeaderValue::from_static("wrong"));
        let result = decode(&headers, GITLAB_PUSH.as_bytes(), SECRET);
        assert!(matches!(
            result,
            Err(JobError::GitlabTokenVerificationFailed)
        ));
    }

    #[test]
    fn test_missing_signature_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        let result = decode(&headers, GITHUB_PUSH.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::MissingSecurityHeader)));
    }

    #[test]
    fn test_unknown_provider() {
        let headers = HeaderMap::new();
        assert!(matches!(
            detect_provider(&headers),
            Err(JobError::UnknownProvider)
        ));
    }

    #[test]
    fn test_forgejo_wins_over_replayed_github_header() {
        let mut headers = signed_headers(Provider::Forgejo, "push", GITHUB_PUSH);
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        assert_eq!(detect_provider(&headers).unwrap(), Provider::Forgejo);
    }

    #[test]
    fn test_github_delete_event_gated() {
        let body = r#"{
            "ref": "feature/old",
            "ref_type": "branch",
            "repository": {
                "name": "shop",
                "full_name": "acme/shop",
                "clone_url": "https://github.com/acme/shop.git"
            }
        }"#;
        let headers = signed_headers(Provider::GitHub, "delete", body);
        let result = decode(&headers, body.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::DeletionEvent)));
    }

    #[test]
    fn test_push_to_zero_sha_gated() {
        let body = format!(
            r#"{{
                "ref": "refs/heads/feature/old",
                "before": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
                "after": "{ZERO_SHA}",
                "repository": {{
                    "name": "shop",
                    "full_name": "acme/shop",
                    "clone_url": "https://github.com/acme/shop.git"
                }}
            }}"#
        );
        let headers = signed_headers(Provider::GitHub, "push", &body);
        let result = decode(&headers, body.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::DeletionEvent)));
    }

    #[test]
    fn test_gitlab_deletion_gated() {
        let body = format!(
            r#"{{
                "object_kind": "push",
                "ref": "refs/heads/feature/old",
                "before": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
                "after": "{ZERO_SHA}",
                "checkout_sha": null,
                "project": {{
                    "name": "shop",
                    "path_with_namespace": "acme/shop",
                    "git_http_url": "https://gitlab.com/acme/shop.git"
                }}
            }}"#
        );
        let headers = signed_headers(Provider::GitLab, "Push Hook", &body);
        let result = decode(&headers, body.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::DeletionEvent)));
    }

    #[test]
    fn test_full_name_traversal_rejected() {
        let body = r#"{
            "ref": "refs/heads/main",
            "after": "59b20b8d5c6ff8d09518454d4dd8b7a425be98ba",
            "repository": {
                "name": "shop",
                "full_name": "acme/../../etc",
                "clone_url": "https://github.com/acme/shop.git"
            }
        }"#;
        let headers = signed_headers(Provider::GitHub, "push", body);
        let result = decode(&headers, body.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::InvalidRepoName(_))));
    }

    #[test]
    fn test_unsupported_event_rejected() {
        let headers = signed_headers(Provider::GitHub, "issues", GITHUB_PUSH);
        let result = decode(&headers, GITHUB_PUSH.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::ParsingPayload(_))));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let body = "{not json";
        let signature = sign(Provider::GitHub, body.as_bytes(), SECRET);
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_str(&signature).unwrap(),
        );
        let result = decode(&headers, body.as_bytes(), SECRET);
        assert!(matches!(result, Err(JobError::ParsingPayload(_))));
    }
}
