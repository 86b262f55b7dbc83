use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::executor::HealthCheckReport;

// Lifecycle of a deployment run. Everything but Running is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// One deploy or rollback run.
///
/// Created in [`DeploymentStatus::Running`] and never modified again once the
/// status moves to a terminal value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub environment: String,
    pub branch: String,
    pub version: String,
    pub status: DeploymentStatus,
    pub rollback: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub webhook: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub started_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
    pub logs: Vec<LogEntry>,
}

impl Deployment {
    pub fn is_running(&self) -> bool {
        self.status == DeploymentStatus::Running
    }

    pub fn push_step(&mut self, name: &str, description: &str, at: DateTime<Utc>) {
        let status = if name == "failed" {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        self.steps.push(StepRecord {
            name: name.to_string(),
            description: description.to_string(),
            timestamp: at,
            status,
        });
    }

    pub fn push_log(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.logs.push(LogEntry {
            timestamp: at,
            message: message.into(),
        });
    }

    pub fn summary(&self) -> DeploymentSummary {
        DeploymentSummary {
            id: self.id.clone(),
            environment: self.environment.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

// Health record per environment, only touched by successful runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub status: String,
    pub version: String,
    pub last_deploy: Option<DateTime<Utc>>,
    pub health: String,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
            version: "1.0.0".to_string(),
            last_deploy: None,
            health: "healthy".to_string(),
        }
    }
}

// POST /deploy/start body
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub version: Option<String>,
    #[serde(default)]
    pub rollback: bool,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            branch: default_branch(),
            version: None,
            rollback: false,
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

// POST /deploy/rollback body
#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub environment: String,
    pub version: Option<String>,
}

// GET /deploy/history query
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub environment: Option<String>,
    pub status: Option<DeploymentStatus>,
}

// Push event from a git host
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: Option<WebhookParty>,
    pub pusher: Option<WebhookParty>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookParty {
    pub name: Option<String>,
}

// Response after a run is accepted
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub id: String,
    pub environment: String,
    pub version: String,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    pub rollback: bool,
}

impl From<&Deployment> for AcceptedResponse {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id.clone(),
            environment: d.environment.clone(),
            version: d.version.clone(),
            status: d.status,
            started_at: d.started_at,
            rollback: d.rollback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub id: String,
    pub environment: String,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// One environment in GET /deploy/health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentHealth {
    pub status: &'static str,
    pub version: String,
    pub last_deploy: Option<DateTime<Utc>>,
    pub details: HealthCheckReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: &'static str,
    pub environments: std::collections::BTreeMap<String, EnvironmentHealth>,
    pub timestamp: DateTime<Utc>,
}

// GET /deploy/logs/{id}
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub deployment: DeploymentSummary,
    pub logs: Vec<LogEntry>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub auto_deploy: bool,
    pub rollback_enabled: bool,
    pub environments: Vec<String>,
}

// GET /deploy/status
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub current: Option<Deployment>,
    pub environments: std::collections::BTreeMap<String, EnvironmentState>,
    pub history: Vec<Deployment>,
    pub features: Features,
}

// GET /deploy/history
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub deploys: Vec<Deployment>,
    pub total: usize,
    pub filters: HistoryQuery,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}
