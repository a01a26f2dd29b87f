//! Uniform JSON response shapes shared by every endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::JobError;

/// `{content, job_id?}`
pub fn success(status: StatusCode, content: &str, job_id: Option<&str>) -> Response {
    let mut body = json!({ "content": content });
    if let Some(job_id) = job_id {
        body["job_id"] = json!(job_id);
    }
    (status, Json(body)).into_response()
}

/// `202 {"content": "job accepted", "job_id": ...}`
pub fn accepted(job_id: &str) -> Response {
    success(StatusCode::ACCEPTED, "job accepted", Some(job_id))
}

/// `{error, job_id?}`
pub fn error_response(status: StatusCode, error: &JobError, job_id: Option<&str>) -> Response {
    let mut body = json!({ "error": error.to_string() });
    if let Some(job_id) = job_id {
        body["job_id"] = json!(job_id);
    }
    (status, Json(body)).into_response()
}

/// Ad-hoc error body for the management API.
pub fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// 429 for a repository that already has a running job.
pub fn busy(repository: &str, holder: Option<&str>, job_id: &str) -> Response {
    let mut body = json!({
        "error": format!("another job is already running for repository '{repository}'"),
        "job_id": job_id,
    });
    if let Some(holder) = holder {
        body["content"] = json!(format!("held by job {holder}"));
    }
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}
