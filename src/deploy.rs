//! Deployment orchestration.
//!
//! [`DeployOrchestrator`] owns every piece of deploy state: the active-run
//! slot, the append-only history and the per-environment records. All of it
//! sits behind one mutex, so admitting a run and claiming the slot happen in a
//! single critical section and two concurrent starts can never both win.
//! Accepted runs are handed to the deploy worker over a queue and executed in
//! the background.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::executor::{HealthCheck, StepContext, StepExecutor};
use crate::metrics::{DEPLOYMENT_ACTIVE, DEPLOYMENT_DURATION, DEPLOYMENTS_TOTAL};
use crate::models::{
    Deployment, DeploymentStatus, DeploymentSummary, EnvironmentHealth, EnvironmentState,
    Features, HealthReport, HistoryQuery, HistoryResponse, LogsResponse, StatusResponse,
};
use crate::worker::deploy_worker;

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("environment {environment} not found")]
    UnknownEnvironment {
        environment: String,
        available: Vec<String>,
    },

    #[error("deployment {id} is already running")]
    Conflict {
        id: String,
        current: Option<DeploymentSummary>,
    },

    #[error("no deployment is running")]
    NotRunning,

    #[error("no previous successful deployment for {0}")]
    NoRollbackVersion(String),

    #[error("rollback is disabled")]
    RollbackDisabled,

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("deploy worker is not accepting runs")]
    WorkerUnavailable,
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub environments: Vec<String>,
    pub rollback_enabled: bool,
    pub auto_deploy: bool,
    pub deploy_branch: String,
    pub status_history: usize, // entries shown by status()
    pub max_history: usize,    // entries retained in memory
    pub step_timeout: Option<Duration>,
    pub queue_capacity: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            environments: vec![
                "development".to_string(),
                "staging".to_string(),
                "production".to_string(),
            ],
            rollback_enabled: true,
            auto_deploy: false,
            deploy_branch: "main".to_string(),
            status_history: 10,
            max_history: 1000,
            step_timeout: None,
            queue_capacity: 16,
        }
    }
}

/// Parameters for a new run.
#[derive(Debug, Clone)]
pub struct StartDeployment {
    pub environment: String,
    pub branch: String,
    pub version: Option<String>,
    pub rollback: bool,
    pub initiator: String,
    pub webhook: bool,
}

impl StartDeployment {
    pub fn new(
        environment: impl Into<String>,
        branch: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            branch: branch.into(),
            version: None,
            rollback: false,
            initiator: initiator.into(),
            webhook: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

// Queue item for the deploy worker
#[derive(Debug, Clone)]
pub struct DeployJob {
    pub id: String,
    pub cancel: CancellationToken,
}

struct ActiveRun {
    id: String,
    cancel: CancellationToken,
}

struct Registry {
    current: Option<ActiveRun>,
    history: Vec<Deployment>,
    environments: BTreeMap<String, EnvironmentState>,
}

impl Registry {
    fn find(&self, id: &str) -> Option<&Deployment> {
        self.history.iter().rev().find(|d| d.id == id)
    }

    fn find_running_mut(&mut self, id: &str) -> Option<&mut Deployment> {
        self.history
            .iter_mut()
            .rev()
            .find(|d| d.id == id)
            .filter(|d| d.is_running())
    }

    // Only the run that owns the slot may release it
    fn release(&mut self, id: &str) {
        if self.current.as_ref().is_some_and(|run| run.id == id) {
            self.current = None;
            DEPLOYMENT_ACTIVE.set(0.0);
        }
    }

    fn trim(&mut self, max: usize) {
        let max = max.max(1);
        if self.history.len() > max {
            let excess = self.history.len() - max;
            self.history.drain(..excess);
        }
    }
}

struct Inner {
    config: DeployConfig,
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
    queue: mpsc::Sender<DeployJob>,
}

#[derive(Clone)]
pub struct DeployOrchestrator {
    inner: Arc<Inner>,
}

impl DeployOrchestrator {
    /// Builds the orchestrator and the receiving end of its run queue.
    ///
    /// The receiver must be driven by [`deploy_worker`]; [`spawn`](Self::spawn)
    /// does both.
    pub fn new(config: DeployConfig, clock: Arc<dyn Clock>) -> (Self, mpsc::Receiver<DeployJob>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let environments = config
            .environments
            .iter()
            .map(|name| (name.clone(), EnvironmentState::default()))
            .collect();

        let orchestrator = Self {
            inner: Arc::new(Inner {
                config,
                clock,
                registry: Mutex::new(Registry {
                    current: None,
                    history: Vec::new(),
                    environments,
                }),
                queue,
            }),
        };
        (orchestrator, rx)
    }

    pub fn spawn(
        config: DeployConfig,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn StepExecutor>,
        shutdown: CancellationToken,
    ) -> Self {
        let (orchestrator, rx) = Self::new(config, clock);
        tokio::spawn(deploy_worker(orchestrator.clone(), rx, executor, shutdown));
        orchestrator
    }

    pub fn config(&self) -> &DeployConfig {
        &self.inner.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub async fn start(&self, request: StartDeployment) -> Result<Deployment, DeployError> {
        let deployment = {
            let mut registry = self.inner.registry.lock().await;
            self.validate_environment(&request.environment)?;
            self.ensure_idle(&registry)?;
            self.admit(&mut registry, request)
        };
        self.enqueue(deployment).await
    }

    pub async fn rollback(
        &self,
        environment: &str,
        version: Option<String>,
        initiator: &str,
    ) -> Result<Deployment, DeployError> {
        if !self.inner.config.rollback_enabled {
            return Err(DeployError::RollbackDisabled);
        }

        let deployment = {
            let mut registry = self.inner.registry.lock().await;
            self.validate_environment(environment)?;
            self.ensure_idle(&registry)?;

            let version = match version {
                Some(version) => version,
                None => previous_success(&registry.history, environment)
                    .ok_or_else(|| DeployError::NoRollbackVersion(environment.to_string()))?,
            };

            let request = StartDeployment {
                environment: environment.to_string(),
                branch: "rollback".to_string(),
                version: Some(version),
                rollback: true,
                initiator: initiator.to_string(),
                webhook: false,
            };
            self.admit(&mut registry, request)
        };
        self.enqueue(deployment).await
    }

    /// Cancels the active run. The worker notices at the next step boundary;
    /// steps that already finished are not undone.
    pub async fn cancel(&self, cancelled_by: &str) -> Result<Deployment, DeployError> {
        let now = self.now();
        let mut registry = self.inner.registry.lock().await;
        let run = registry.current.take().ok_or(DeployError::NotRunning)?;
        DEPLOYMENT_ACTIVE.set(0.0);
        run.cancel.cancel();

        let deployment = registry
            .find_running_mut(&run.id)
            .ok_or(DeployError::NotRunning)?;
        deployment.push_log(format!("Deploy cancelled by {cancelled_by}"), now);
        deployment.status = DeploymentStatus::Cancelled;
        deployment.ended_at = Some(now);
        deployment.cancelled_by = Some(cancelled_by.to_string());

        let snapshot = deployment.clone();
        observe_terminal(&snapshot);
        info!(
            deployment_id = %snapshot.id,
            environment = %snapshot.environment,
            user = cancelled_by,
            "deploy cancelled"
        );
        Ok(snapshot)
    }

    pub async fn status(&self) -> StatusResponse {
        let registry = self.inner.registry.lock().await;
        let current = registry
            .current
            .as_ref()
            .and_then(|run| registry.find(&run.id))
            .cloned();
        let history = last_n(&registry.history, self.inner.config.status_history).to_vec();

        StatusResponse {
            current,
            environments: registry.environments.clone(),
            history,
            features: Features {
                auto_deploy: self.inner.config.auto_deploy,
                rollback_enabled: self.inner.config.rollback_enabled,
                environments: self.inner.config.environments.clone(),
            },
        }
    }

    pub async fn history(&self, query: HistoryQuery) -> HistoryResponse {
        let registry = self.inner.registry.lock().await;
        let matching: Vec<&Deployment> = registry
            .history
            .iter()
            .filter(|d| query.environment.as_ref().is_none_or(|env| &d.environment == env))
            .filter(|d| query.status.is_none_or(|status| d.status == status))
            .collect();

        // 0 means everything that matched
        let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let shown = if limit == 0 {
            &matching[..]
        } else {
            last_n(&matching, limit)
        };
        let deploys = shown.iter().map(|d| (*d).clone()).collect();

        HistoryResponse {
            deploys,
            total: matching.len(),
            filters: HistoryQuery {
                limit: Some(limit),
                ..query
            },
        }
    }

    /// Checks every configured environment. Checks run outside the registry
    /// lock, so deploys are not blocked while they are in flight.
    pub async fn health(&self, checker: &dyn HealthCheck) -> HealthReport {
        let environments = self.inner.registry.lock().await.environments.clone();

        let mut checked = BTreeMap::new();
        for (name, state) in environments {
            let details = checker.check(&name).await;
            checked.insert(
                name,
                EnvironmentHealth {
                    status: if details.healthy { "healthy" } else { "unhealthy" },
                    version: state.version,
                    last_deploy: state.last_deploy,
                    details,
                },
            );
        }

        let healthy = checked.values().all(|e| e.details.healthy);
        HealthReport {
            overall: if healthy { "healthy" } else { "degraded" },
            environments: checked,
            timestamp: self.now(),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Deployment, DeployError> {
        let registry = self.inner.registry.lock().await;
        registry
            .find(id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(id.to_string()))
    }

    pub async fn logs(&self, id: &str) -> Result<LogsResponse, DeployError> {
        let deployment = self.get(id).await?;
        Ok(LogsResponse {
            deployment: deployment.summary(),
            logs: deployment.logs,
            steps: deployment.steps,
        })
    }

    fn validate_environment(&self, environment: &str) -> Result<(), DeployError> {
        if self.inner.config.environments.iter().any(|e| e == environment) {
            return Ok(());
        }
        Err(DeployError::UnknownEnvironment {
            environment: environment.to_string(),
            available: self.inner.config.environments.clone(),
        })
    }

    fn ensure_idle(&self, registry: &Registry) -> Result<(), DeployError> {
        match &registry.current {
            Some(run) => Err(DeployError::Conflict {
                id: run.id.clone(),
                current: registry.find(&run.id).map(Deployment::summary),
            }),
            None => Ok(()),
        }
    }

    // Caller holds the registry lock and has checked the slot is free
    fn admit(&self, registry: &mut Registry, request: StartDeployment) -> Deployment {
        let now = self.now();
        let deployment = Deployment {
            id: generate_deploy_id(now),
            environment: request.environment,
            branch: request.branch,
            version: request.version.unwrap_or_else(|| generate_version(now)),
            status: DeploymentStatus::Running,
            rollback: request.rollback,
            webhook: request.webhook,
            started_at: now,
            ended_at: None,
            started_by: request.initiator,
            cancelled_by: None,
            error: None,
            steps: Vec::new(),
            logs: Vec::new(),
        };

        registry.current = Some(ActiveRun {
            id: deployment.id.clone(),
            cancel: CancellationToken::new(),
        });
        registry.history.push(deployment.clone());
        registry.trim(self.inner.config.max_history);
        DEPLOYMENT_ACTIVE.set(1.0);

        info!(
            deployment_id = %deployment.id,
            environment = %deployment.environment,
            branch = %deployment.branch,
            version = %deployment.version,
            user = %deployment.started_by,
            rollback = deployment.rollback,
            "deploy started"
        );
        deployment
    }

    async fn enqueue(&self, deployment: Deployment) -> Result<Deployment, DeployError> {
        let cancel = {
            let registry = self.inner.registry.lock().await;
            match &registry.current {
                Some(run) if run.id == deployment.id => run.cancel.clone(),
                // cancelled before it was even queued
                _ => return Ok(deployment),
            }
        };

        let job = DeployJob {
            id: deployment.id.clone(),
            cancel,
        };
        if self.inner.queue.send(job).await.is_err() {
            self.fail(&deployment.id, "deploy worker unavailable").await;
            return Err(DeployError::WorkerUnavailable);
        }
        Ok(deployment)
    }

    // ---- worker side -------------------------------------------------------

    pub(crate) async fn context(&self, id: &str) -> Option<StepContext> {
        let mut registry = self.inner.registry.lock().await;
        registry.find_running_mut(id).map(|d| StepContext {
            deployment_id: d.id.clone(),
            environment: d.environment.clone(),
            branch: d.branch.clone(),
            version: d.version.clone(),
            rollback: d.rollback,
        })
    }

    /// Appends a step record. Returns `false` once the run is no longer running.
    pub(crate) async fn record_step(&self, id: &str, name: &str, description: &str) -> bool {
        let now = self.now();
        let mut registry = self.inner.registry.lock().await;
        match registry.find_running_mut(id) {
            Some(deployment) => {
                deployment.push_step(name, description, now);
                true
            }
            None => false,
        }
    }

    pub(crate) async fn record_log(&self, id: &str, message: String) -> bool {
        let now = self.now();
        let mut registry = self.inner.registry.lock().await;
        match registry.find_running_mut(id) {
            Some(deployment) => {
                deployment.push_log(message, now);
                true
            }
            None => false,
        }
    }

    pub(crate) async fn complete(&self, id: &str) {
        let now = self.now();
        let mut registry = self.inner.registry.lock().await;
        let Some(deployment) = registry.find_running_mut(id) else {
            return;
        };

        deployment.status = DeploymentStatus::Success;
        deployment.ended_at = Some(now);
        deployment.push_step("completed", "Deploy completed successfully", now);
        let snapshot = deployment.clone();

        if let Some(env) = registry.environments.get_mut(&snapshot.environment) {
            env.version = snapshot.version.clone();
            env.last_deploy = Some(now);
            env.status = "healthy".to_string();
            env.health = "healthy".to_string();
        }
        registry.release(id);
        drop(registry);

        observe_terminal(&snapshot);
        info!(
            deployment_id = %snapshot.id,
            environment = %snapshot.environment,
            version = %snapshot.version,
            duration_ms = (now - snapshot.started_at).num_milliseconds(),
            "deploy completed"
        );
    }

    pub(crate) async fn fail(&self, id: &str, error: impl Into<String>) {
        let error = error.into();
        let now = self.now();
        let mut registry = self.inner.registry.lock().await;
        let Some(deployment) = registry.find_running_mut(id) else {
            return;
        };

        deployment.status = DeploymentStatus::Failed;
        deployment.ended_at = Some(now);
        deployment.error = Some(error.clone());
        deployment.push_step("failed", &format!("Deploy failed: {error}"), now);
        deployment.push_log(format!("Deploy failed: {error}"), now);
        let snapshot = deployment.clone();
        registry.release(id);
        drop(registry);

        observe_terminal(&snapshot);
        warn!(
            deployment_id = %snapshot.id,
            environment = %snapshot.environment,
            error = %error,
            "deploy failed"
        );
    }
}

fn observe_terminal(deployment: &Deployment) {
    DEPLOYMENTS_TOTAL
        .with_label_values(&[deployment.environment.as_str(), deployment.status.as_str()])
        .inc();
    if let Some(ended) = deployment.ended_at {
        let secs = (ended - deployment.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        DEPLOYMENT_DURATION.observe(secs);
    }
}

// Version of the older of the two latest successful runs
fn previous_success(history: &[Deployment], environment: &str) -> Option<String> {
    let mut successes = history
        .iter()
        .rev()
        .filter(|d| d.environment == environment && d.status == DeploymentStatus::Success);
    successes.next()?;
    successes.next().map(|d| d.version.clone())
}

fn last_n<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn generate_deploy_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("deploy-{}-{}", now.timestamp_millis(), suffix)
}

// e.g. 2024.03.07-1405
pub fn generate_version(now: DateTime<Utc>) -> String {
    now.format("%Y.%m.%d-%H%M").to_string()
}
