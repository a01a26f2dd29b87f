//! # Error Kinds
//!
//! Typed error kinds for everything that can abort a job, with their HTTP
//! status mapping and the stable kind string used as a metrics label.
//!
//! Policy: every abort path emits exactly one failure notification,
//! increments the matching `*_errors_total` counter, and carries the job id
//! in every log line and response.

use axum::http::StatusCode;

/// Everything that can go wrong between an inbound trigger and a committed
/// deployment.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("method not allowed")]
    InvalidMethod,
    #[error("missing security header")]
    MissingSecurityHeader,
    #[error("incorrect secret key")]
    HmacVerificationFailed,
    #[error("incorrect gitlab token")]
    GitlabTokenVerificationFailed,
    #[error("failed to parse payload: {0}")]
    ParsingPayload(String),
    #[error("unknown webhook provider")]
    UnknownProvider,
    #[error("branch or tag deletion event received")]
    DeletionEvent,
    #[error("invalid repository name '{0}'")]
    InvalidRepoName(String),
    #[error("path '{0}' escapes the data mount point")]
    PathTraversal(String),
    #[error("missing access token for private repository")]
    MissingAccessToken,
    #[error("failed to clone repository: {0}")]
    CloneFailed(String),
    #[error("failed to check out '{reference}': {message}")]
    CheckoutFailed { reference: String, message: String },
    #[error("failed to decrypt '{0}'")]
    DecryptFailed(String),
    #[error("invalid deploy-config: {0}")]
    DeployConfigInvalid(String),
    #[error("deployment '{name}' belongs to repository '{owner}'")]
    DeploymentConflict { name: String, owner: String },
    #[error("stack '{0}' is not managed by this daemon")]
    NotManaged(String),
    #[error("image pull access denied for '{0}'")]
    ImagePullAccessDenied(String),
    #[error("services did not converge within {0} seconds")]
    ServiceConvergenceTimeout(u64),
    #[error("failed to resolve external secrets: {0}")]
    SecretsResolutionFailed(String),
    #[error("container engine connection failed: {0}")]
    EngineConnectionFailed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl JobError {
    /// Stable snake_case identifier, used as the metrics label and in
    /// structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMethod => "invalid_method",
            Self::MissingSecurityHeader => "missing_security_header",
            Self::HmacVerificationFailed => "hmac_verification_failed",
            Self::GitlabTokenVerificationFailed => "gitlab_token_verification_failed",
            Self::ParsingPayload(_) => "parsing_payload",
            Self::UnknownProvider => "unknown_provider",
            Self::DeletionEvent => "deletion_event",
            Self::InvalidRepoName(_) => "invalid_repo_name",
            Self::PathTraversal(_) => "path_traversal",
            Self::MissingAccessToken => "missing_access_token",
            Self::CloneFailed(_) => "clone_failed",
            Self::CheckoutFailed { .. } => "checkout_failed",
            Self::DecryptFailed(_) => "decrypt_failed",
            Self::DeployConfigInvalid(_) => "deploy_config_invalid",
            Self::DeploymentConflict { .. } => "deployment_conflict",
            Self::NotManaged(_) => "not_managed",
            Self::ImagePullAccessDenied(_) => "image_pull_access_denied",
            Self::ServiceConvergenceTimeout(_) => "service_convergence_timeout",
            Self::SecretsResolutionFailed(_) => "secrets_resolution_failed",
            Self::EngineConnectionFailed(_) => "engine_connection_failed",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the uniform JSON error response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingSecurityHeader
            | Self::UnknownProvider
            | Self::InvalidRepoName(_)
            | Self::PathTraversal(_) => StatusCode::BAD_REQUEST,
            Self::HmacVerificationFailed | Self::GitlabTokenVerificationFailed => {
                StatusCode::UNAUTHORIZED
            }
            // Intentional skip, not a failure
            Self::DeletionEvent => StatusCode::ACCEPTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            JobError::InvalidMethod.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            JobError::HmacVerificationFailed.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(JobError::DeletionEvent.status_code(), StatusCode::ACCEPTED);
        assert_eq!(
            JobError::PathTraversal("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            JobError::CloneFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(JobError::DeletionEvent.kind(), "deletion_event");
        assert_eq!(
            JobError::DeploymentConflict {
                name: "web".into(),
                owner: "acme/other".into()
            }
            .kind(),
            "deployment_conflict"
        );
    }
}
