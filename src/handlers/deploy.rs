use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, response::IntoResponse};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::auth::Principal;
use crate::deploy::StartDeployment;
use crate::error::ApiError;
use crate::middleware::{ClientIp, enforce};
use crate::models::{
    AcceptedResponse, Deployment, HealthReport, HistoryQuery, HistoryResponse, LogsResponse,
    RollbackRequest, StartRequest, StatusResponse, WebhookPayload,
};
use crate::state::AppState;

// Bearer auth, operator role, then the per-user budget
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let principal = state.users.authenticate(headers)?;
    principal.require_operator()?;
    enforce(&state.limiters.user, &format!("user:{}", principal.username))?;
    Ok(principal)
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_required(body)
}

fn parse_required<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("Invalid JSON: {e}")))
}

pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    enforce(&state.limiters.deploy, &ip)?;
    let principal = authorize(&state, &headers)?;
    let request: StartRequest = parse_body(&body)?;

    let deployment = state
        .deploys
        .start(StartDeployment {
            environment: request.environment,
            branch: request.branch,
            version: request.version,
            rollback: request.rollback,
            initiator: principal.username,
            webhook: false,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(&deployment))))
}

pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Deployment>, ApiError> {
    let principal = authorize(&state, &headers)?;
    let deployment = state.deploys.cancel(&principal.username).await?;
    Ok(Json(deployment))
}

pub async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    enforce(&state.limiters.deploy, &ip)?;
    let principal = authorize(&state, &headers)?;
    let request: RollbackRequest = parse_required(&body)?;

    let deployment = state
        .deploys
        .rollback(&request.environment, request.version, &principal.username)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse::from(&deployment))))
}

pub async fn deploy_health_handler(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.deploys.health(state.health.as_ref()).await)
}

pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.deploys.status().await)
}

pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
    Ok(Json(state.deploys.history(query).await))
}

pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    Ok(Json(state.deploys.logs(&id).await?))
}

// Push webhook from the git host; deploys the configured branch to development
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    enforce(&state.limiters.strict, &ip)?;

    let config = state.deploys.config();
    if !config.auto_deploy {
        return Err(ApiError::AutoDeployDisabled);
    }

    let payload: WebhookPayload = parse_required(&body)?;
    let expected = format!("refs/heads/{}", config.deploy_branch);
    if payload.git_ref != expected {
        return Ok((
            StatusCode::OK,
            Json(json!({ "message": "Branch ignored", "branch": payload.git_ref })),
        ));
    }

    info!(
        repository = payload.repository.and_then(|r| r.name).as_deref().unwrap_or("unknown"),
        pusher = payload.pusher.and_then(|p| p.name).as_deref().unwrap_or("unknown"),
        branch = %payload.git_ref,
        "webhook received"
    );

    let deployment = state
        .deploys
        .start(StartDeployment {
            webhook: true,
            ..StartDeployment::new("development", config.deploy_branch.clone(), "webhook")
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Auto-deploy triggered", "deployId": deployment.id })),
    ))
}
