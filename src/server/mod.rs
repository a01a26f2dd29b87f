//! # HTTP Surface
//!
//! The trigger and management endpoints:
//!
//! - `GET /v1/health` - liveness gated on the engine connection
//! - `POST /v1/webhook[/{custom_target}]` - push events, async by default,
//!   synchronous with `?wait=true`
//! - `/v1/api/...` - management REST surface (see [`api`])
//!
//! Responses are uniform JSON: success `{content, job_id?}`, error
//! `{error, content?, job_id?}`. A second server on the metrics port
//! exposes Prometheus text format.

pub mod api;
mod response;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

use crate::engine::ContainerEngine;
use crate::errors::JobError;
use crate::job::{Job, Trigger};
use crate::observability::metrics;
use crate::reconciler::Reconciler;
use crate::repo;
use crate::webhook;

use response::{accepted, error_response, success};

/// Shared state of all HTTP handlers.
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

/// Build the main router (webhooks + management API + health).
pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.reconciler.config.max_payload_size;
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/webhook", post(webhook_default))
        .route("/v1/webhook/{custom_target}", post(webhook_with_target))
        .merge(api::router())
        .layer(DefaultBodyLimit::max(max_body.saturating_add(1)))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the main router until the reconciler's cancel token fires.
pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let cancel = state.reconciler.cancel_token();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Serve the Prometheus endpoint on its own port.
pub async fn serve_metrics(
    cancel: tokio_util::sync::CancellationToken,
    port: u16,
) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("failed to encode metrics: {e}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

/// Liveness: healthy only while the engine connection is verified.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let job_id = uuid::Uuid::now_v7().to_string();
    match state.reconciler.engine.ping().await {
        Ok(()) => success(StatusCode::OK, "healthy", Some(&job_id)),
        Err(e) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &JobError::EngineConnectionFailed(e.to_string()),
            Some(&job_id),
        ),
    }
}

async fn webhook_default(
    State(state): State<Arc<AppState>>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(state, None, params, headers, body).await
}

async fn webhook_with_target(
    State(state): State<Arc<AppState>>,
    Path(custom_target): Path<String>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(state, Some(custom_target), params, headers, body).await
}

/// Webhook admission: size cap, decode, repository lock, then either run
/// synchronously (`?wait=true`) or hand the job to a background task and
/// answer 202 immediately.
async fn handle_webhook(
    state: Arc<AppState>,
    custom_target: Option<String>,
    params: std::collections::HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let reconciler = &state.reconciler;

    if body.len() > reconciler.config.max_payload_size {
        let e = JobError::ParsingPayload(format!(
            "payload exceeds maximum size of {} bytes",
            reconciler.config.max_payload_size
        ));
        metrics::increment_webhook_errors(e.kind());
        return error_response(e.status_code(), &e, None);
    }

    let (provider, payload) =
        match webhook::decode(&headers, &body, &reconciler.config.webhook_secret) {
            Ok(decoded) => decoded,
            Err(e @ JobError::DeletionEvent) => {
                // Intentional skip, not a failure
                info!("branch or tag deletion event received, skipping");
                return success(StatusCode::ACCEPTED, &e.to_string(), None);
            }
            Err(e) => {
                metrics::increment_webhook_errors(e.kind());
                return error_response(e.status_code(), &e, None);
            }
        };

    let repo_name = match repo::normalize_repo_name(&payload.clone_url) {
        Ok(name) => name,
        Err(e) => {
            metrics::increment_webhook_errors(e.kind());
            return error_response(e.status_code(), &e, None);
        }
    };

    let job = Job::new(Trigger::Webhook, repo_name.clone(), payload, custom_target);
    info!(
        job_id = job.job_id,
        provider = provider.as_str(),
        repository = repo_name,
        reference = job.reference,
        "webhook decoded"
    );

    let lock = reconciler.locks.get(&repo_name);
    if !lock.try_lock(&job.job_id) {
        metrics::increment_webhook_errors("repository_busy");
        return response::busy(&repo_name, lock.holder().as_deref(), &job.job_id);
    }
    metrics::increment_webhook_requests();

    let wait = params
        .get("wait")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if wait {
        let result = reconciler.run_job(&job, None).await;
        lock.unlock();
        metrics::observe_webhook_duration(job.elapsed().as_secs_f64());
        return match result {
            Ok(outcome) => success(StatusCode::OK, &outcome.summary(), Some(&job.job_id)),
            Err(e) => {
                metrics::increment_webhook_errors(e.kind());
                error_response(e.status_code(), &e, Some(&job.job_id))
            }
        };
    }

    // Async mode: the HTTP response ends here; the job continues on its own
    // task and reports through logs, metrics and notifications only
    let job_id = job.job_id.clone();
    let reconciler = Arc::clone(reconciler);
    tokio::spawn(async move {
        let result = reconciler.run_job(&job, None).await;
        lock.unlock();
        metrics::observe_webhook_duration(job.elapsed().as_secs_f64());
        if let Err(e) = result {
            metrics::increment_webhook_errors(e.kind());
        }
    });
    accepted(&job_id)
}
