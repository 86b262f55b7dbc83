use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::auth::{IssuedToken, Principal, RefreshedToken, bearer_token};
use crate::error::ApiError;
use crate::middleware::{ClientIp, enforce};
use crate::models::{ChangePasswordRequest, LoginRequest, RefreshRequest};
use crate::state::AppState;

// Only failed attempts count against the login budget
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Json<IssuedToken>, ApiError> {
    enforce(&state.limiters.login, &ip)?;

    let request: LoginRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::Validation("Username and password required".to_string()))?;
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::Validation(
            "Username and password required".to_string(),
        ));
    }

    let issued = state.users.login(&request.username, &request.password)?;
    state.limiters.login.refund(&ip);
    Ok(Json(issued))
}

pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.users.authenticate(&headers)?;
    if let Some(token) = bearer_token(&headers) {
        state.users.logout(token);
    }
    Ok(Json(json!({ "message": "Logged out" })))
}

pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Principal>, ApiError> {
    Ok(Json(state.users.authenticate(&headers)?))
}

// Refresh attempts share the login budget
pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<Json<RefreshedToken>, ApiError> {
    enforce(&state.limiters.login, &ip)?;

    let request: RefreshRequest = serde_json::from_slice(&body).unwrap_or_default();
    if request.refresh_token.is_empty() {
        return Err(ApiError::Validation("Refresh token is required".to_string()));
    }

    let refreshed = state.users.refresh(&request.refresh_token)?;
    state.limiters.login.refund(&ip);
    Ok(Json(refreshed))
}

pub async fn verify_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return invalid_token("No token provided");
    };
    match state.users.verify(token) {
        Some(info) => Json(info).into_response(),
        None => invalid_token("Invalid or expired token"),
    }
}

fn invalid_token(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "valid": false, "message": message })),
    )
        .into_response()
}

pub async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let principal = state.users.authenticate(&headers)?;
    enforce(&state.limiters.user, &format!("user:{}", principal.username))?;

    let request: ChangePasswordRequest = serde_json::from_slice(&body).unwrap_or_default();
    state.users.change_password(
        &principal,
        &request.current_password,
        &request.new_password,
    )?;
    Ok(Json(json!({ "message": "Password changed successfully" })))
}
