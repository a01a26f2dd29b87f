//! # Management API
//!
//! Thin REST surface over the engine: listing, inspecting, and controlling
//! compose projects (standalone) and stacks (swarm). Every endpoint
//! requires the configured `X-API-Key`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use tracing::info;

use super::response::api_error;
use super::AppState;
use crate::constants::{self, labels};
use crate::engine::{ContainerEngine, DestroyOptions, EngineError, LifecycleOp};
use crate::webhook::constant_time_eq;

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/v1/api/projects", get(list_projects))
        .route("/v1/api/project/{name}", get(get_project))
        .route("/v1/api/project/{name}", delete(delete_project))
        .route("/v1/api/project/{name}/{action}", post(project_action))
        .route("/v1/api/stacks", get(list_stacks))
        .route("/v1/api/stack/{name}", get(get_stack))
        .route("/v1/api/stack/{name}", delete(delete_stack))
        .route("/v1/api/stack/{name}/{action}", post(stack_action))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(
        provided.as_bytes(),
        state.reconciler.config.api_secret.as_bytes(),
    ) {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}

fn engine_error(error: &EngineError) -> Response {
    match error {
        EngineError::NotFound(name) => {
            api_error(StatusCode::NOT_FOUND, &format!("'{name}' not found"))
        }
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
    }
}

fn parse_bool(params: &HashMap<String, String>, key: &str) -> bool {
    params
        .get(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let all = parse_bool(&params, "all");
    match state.reconciler.engine.list_projects(all).await {
        Ok(projects) => (StatusCode::OK, Json(projects)).into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.reconciler.engine.list_projects(true).await {
        Ok(projects) => match projects.into_iter().find(|p| p.name == name) {
            Some(project) => (StatusCode::OK, Json(project)).into_response(),
            None => api_error(StatusCode::NOT_FOUND, &format!("project '{name}' not found")),
        },
        Err(e) => engine_error(&e),
    }
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    remove_managed(&state, &name, &params).await
}

async fn delete_stack(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    remove_managed(&state, &name, &params).await
}

/// Removal only touches deployments this daemon owns; anything else on the
/// host is refused.
async fn remove_managed(
    state: &AppState,
    name: &str,
    params: &HashMap<String, String>,
) -> Response {
    let engine = &state.reconciler.engine;
    let existing = match engine.stack_labels(name).await {
        Ok(existing) => existing,
        Err(e) => return engine_error(&e),
    };
    let Some(existing_labels) = existing else {
        return api_error(StatusCode::NOT_FOUND, &format!("'{name}' not found"));
    };
    if existing_labels.get(labels::MANAGER).map(String::as_str) != Some(constants::APP_NAME) {
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("'{name}' is not managed by this daemon"),
        );
    }

    let opts = DestroyOptions {
        remove_volumes: parse_bool(params, "volumes"),
        remove_images: parse_bool(params, "images"),
    };
    info!(name, remove_volumes = opts.remove_volumes, "removing deployment via api");
    match engine.destroy(name, &opts).await {
        Ok(()) => super::response::success(StatusCode::OK, &format!("'{name}' removed"), None),
        Err(e) => engine_error(&e),
    }
}

async fn project_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((name, action)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let op = match action.as_str() {
        "start" => LifecycleOp::Start,
        "stop" => LifecycleOp::Stop,
        "restart" => LifecycleOp::Restart,
        other => {
            return api_error(StatusCode::BAD_REQUEST, &format!("unknown action '{other}'"))
        }
    };
    let timeout = params.get("timeout").and_then(|t| t.parse().ok());
    match state
        .reconciler
        .engine
        .project_lifecycle(&name, op, timeout)
        .await
    {
        Ok(()) => super::response::success(
            StatusCode::OK,
            &format!("{} '{name}' done", op.as_str()),
            None,
        ),
        Err(e) => engine_error(&e),
    }
}

async fn list_stacks(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.reconciler.engine.list_stacks().await {
        Ok(stacks) => (StatusCode::OK, Json(stacks)).into_response(),
        Err(e) => engine_error(&e),
    }
}

async fn get_stack(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.reconciler.engine.list_stacks().await {
        Ok(stacks) => match stacks.into_iter().find(|s| s.name == name) {
            Some(stack) => (StatusCode::OK, Json(stack)).into_response(),
            None => api_error(StatusCode::NOT_FOUND, &format!("stack '{name}' not found")),
        },
        Err(e) => engine_error(&e),
    }
}

async fn stack_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((name, action)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let engine = &state.reconciler.engine;
    let result = match action.as_str() {
        "scale" => {
            let Some(replicas) = params.get("replicas").and_then(|r| r.parse::<u64>().ok())
            else {
                return api_error(StatusCode::BAD_REQUEST, "missing or invalid 'replicas'");
            };
            let Some(service) = params.get("service").filter(|s| !s.is_empty()) else {
                return api_error(StatusCode::BAD_REQUEST, "missing 'service'");
            };
            let wait = parse_bool(&params, "wait");
            engine.scale_service(&name, service, replicas, wait).await
        }
        "restart" => engine.restart_stack(&name).await,
        "run" => engine.run_stack_jobs(&name).await,
        other => {
            return api_error(StatusCode::BAD_REQUEST, &format!("unknown action '{other}'"))
        }
    };
    match result {
        Ok(()) => super::response::success(StatusCode::OK, &format!("{action} '{name}' done"), None),
        Err(e) => engine_error(&e),
    }
}
