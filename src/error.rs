//! API error types.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::deploy::DeployError;
use crate::models::DeploymentSummary;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid environment: {environment}")]
    InvalidEnvironment {
        environment: String,
        available: Vec<String>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Deploy in progress: {id}")]
    DeployInProgress {
        id: String,
        current: Option<DeploymentSummary>,
    },

    #[error("No deploy running")]
    NoDeployRunning,

    #[error("No version to rollback for {0}")]
    NoRollbackVersion(String),

    #[error("Rollback disabled")]
    RollbackDisabled,

    #[error("Auto-deploy disabled")]
    AutoDeployDisabled,

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("Authentication required: {0}")]
    Unauthenticated(&'static str),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Current password is incorrect")]
    WrongPassword,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Rate limit exceeded ({limiter})")]
    RateLimited {
        limiter: &'static str,
        message: &'static str,
        limit: u32,
        retry_after: u64,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidEnvironment { .. } => "Invalid environment",
            Self::Validation(_) => "Validation error",
            Self::DeployInProgress { .. } => "Deploy in progress",
            Self::NoDeployRunning => "No deploy running",
            Self::NoRollbackVersion(_) => "No version to rollback",
            Self::RollbackDisabled => "Rollback disabled",
            Self::AutoDeployDisabled => "Auto-deploy disabled",
            Self::DeploymentNotFound(_) => "Deploy not found",
            Self::Unauthenticated(_) | Self::Forbidden => "Access denied",
            Self::InvalidCredentials => "Invalid credentials",
            Self::WrongPassword => "Invalid password",
            Self::AccountDisabled => "Account disabled",
            Self::RateLimited { .. } => "Too many requests",
            Self::Internal(_) => "Internal server error",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidEnvironment { .. }
            | Self::Validation(_)
            | Self::NoDeployRunning
            | Self::NoRollbackVersion(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_)
            | Self::InvalidCredentials
            | Self::WrongPassword
            | Self::AccountDisabled => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden | Self::RollbackDisabled | Self::AutoDeployDisabled => {
                StatusCode::FORBIDDEN
            }
            Self::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
            Self::DeployInProgress { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidEnvironment { environment, .. } => {
                format!("Environment {environment} not found")
            }
            Self::Validation(reason) => reason.clone(),
            Self::DeployInProgress { id, .. } => {
                format!("Another deployment is currently running ({id})")
            }
            Self::NoDeployRunning => "No deployment is currently running".to_owned(),
            Self::NoRollbackVersion(_) => "No previous successful deployment found".to_owned(),
            Self::RollbackDisabled => "Rollback feature is disabled in configuration".to_owned(),
            Self::AutoDeployDisabled => "Auto-deploy feature is disabled".to_owned(),
            Self::DeploymentNotFound(id) => format!("Deployment {id} not found"),
            Self::Unauthenticated(reason) => (*reason).to_owned(),
            Self::InvalidCredentials => "Username or password incorrect".to_owned(),
            Self::WrongPassword => "Current password is incorrect".to_owned(),
            Self::AccountDisabled => "Your account has been disabled".to_owned(),
            Self::Forbidden => "Insufficient permissions".to_owned(),
            Self::RateLimited { message, .. } => (*message).to_owned(),
            // never leak internals to callers
            Self::Internal(_) => "An unexpected error occurred".to_owned(),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::UnknownEnvironment {
                environment,
                available,
            } => Self::InvalidEnvironment {
                environment,
                available,
            },
            DeployError::Conflict { id, current } => Self::DeployInProgress { id, current },
            DeployError::NotRunning => Self::NoDeployRunning,
            DeployError::NoRollbackVersion(env) => Self::NoRollbackVersion(env),
            DeployError::RollbackDisabled => Self::RollbackDisabled,
            DeployError::NotFound(id) => Self::DeploymentNotFound(id),
            DeployError::WorkerUnavailable => Self::Internal("deploy worker unavailable".to_owned()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let Self::Internal(detail) = &self {
            tracing::error!(error = %detail, "internal error");
        }

        let mut body = json!({
            "error": self.error_type(),
            "message": self.message(),
        });

        match &self {
            Self::InvalidEnvironment { available, .. } => {
                body["availableEnvironments"] = json!(available);
            }
            Self::RateLimited { retry_after, .. } => {
                body["retryAfter"] = json!(retry_after);
            }
            Self::DeployInProgress {
                current: Some(current),
                ..
            } => {
                body["currentDeployment"] = json!(current);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimited {
            limit, retry_after, ..
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
            headers.insert("ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("ratelimit-remaining", HeaderValue::from(0u32));
            headers.insert("ratelimit-reset", HeaderValue::from(*retry_after));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        assert_eq!(
            ApiError::DeployInProgress {
                id: "deploy-1".into(),
                current: None,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::NoDeployRunning.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::DeploymentNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::RollbackDisabled.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Internal("db".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_hint() {
        let response = ApiError::RateLimited {
            limiter: "deploy",
            message: "slow down",
            limit: 3,
            retry_after: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(response.headers()["ratelimit-limit"], "3");
    }

    #[tokio::test]
    async fn conflict_body_names_current_deployment() {
        let response = ApiError::DeployInProgress {
            id: "deploy-1-abcde".into(),
            current: Some(DeploymentSummary {
                id: "deploy-1-abcde".into(),
                environment: "staging".into(),
                status: crate::models::DeploymentStatus::Running,
                started_at: chrono::Utc::now(),
                ended_at: None,
            }),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["currentDeployment"]["id"], "deploy-1-abcde");
        assert_eq!(body["currentDeployment"]["status"], "running");
    }

    #[test]
    fn internal_message_is_generic() {
        let err = ApiError::Internal("connection refused to 10.0.0.5".into());
        assert_eq!(err.message(), "An unexpected error occurred");
    }
}
