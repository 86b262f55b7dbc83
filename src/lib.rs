//! Operations API: per-client rate limiting in front of a single-slot deploy
//! orchestrator.

pub mod auth;
pub mod clock;
pub mod config;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod state;
mod worker;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;

use crate::handlers::{
    change_password_handler, deploy_health_handler, health_handler, history_handler,
    live_handler, login_handler, logout_handler, logs_handler, me_handler, metrics_handler,
    ready_handler, refresh_handler, rollback_handler, start_handler, status_handler, stop_handler,
    verify_handler, webhook_handler,
};
use crate::middleware::rate_limit;
use crate::state::AppState;

// creating the router with routes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/verify", get(verify_handler))
        .route("/auth/change-password", post(change_password_handler))
        .route("/deploy/start", post(start_handler))
        .route("/deploy/stop", post(stop_handler))
        .route("/deploy/rollback", post(rollback_handler))
        .route("/deploy/status", get(status_handler))
        .route("/deploy/history", get(history_handler))
        .route("/deploy/health", get(deploy_health_handler))
        .route("/deploy/logs/{id}", get(logs_handler))
        .route("/deploy/webhook", post(webhook_handler))
        .layer(axum_middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}
