use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::UserDirectory;
use crate::clock::Clock;
use crate::config::Args;
use crate::deploy::DeployOrchestrator;
use crate::executor::{HealthCheck, SimulatedExecutor};
use crate::rate_limit::{RateLimitConfig, RateLimiters};

// app's shared state
pub struct AppState {
    pub limiters: Arc<RateLimiters>,
    pub deploys: DeployOrchestrator,
    pub users: UserDirectory,
    pub health: Arc<dyn HealthCheck>,
    pub trust_proxy: bool, // key limiters on X-Forwarded-For / X-Real-IP
    pub sweep_interval: Duration,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        limits: &RateLimitConfig,
        deploys: DeployOrchestrator,
        users: UserDirectory,
        health: Arc<dyn HealthCheck>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiters: Arc::new(RateLimiters::new(limits, clock)),
            deploys,
            users,
            health,
            trust_proxy: false,
            sweep_interval: limits.sweep_interval,
            started_at: Instant::now(),
        }
    }

    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// Wires the whole service from command-line arguments and starts the
    /// deploy worker.
    pub fn from_args(
        args: &Args,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self, String> {
        let executor = Arc::new(SimulatedExecutor::new(args.simulation_config()));
        let deploy_config = args.deploy_config();
        if deploy_config.environments.is_empty() {
            return Err("at least one environment required".to_string());
        }

        let deploys = DeployOrchestrator::spawn(
            deploy_config,
            Arc::clone(&clock),
            executor.clone(),
            shutdown,
        );
        let users = UserDirectory::new(args.users()?, args.token_ttl(), Arc::clone(&clock));

        Ok(
            Self::new(&args.rate_limit_config(), deploys, users, executor, clock)
                .with_trust_proxy(args.trust_proxy),
        )
    }
}

// Maintenance loop - evicts expired rate limit windows and sessions
pub async fn maintenance(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut interval = interval(state.sweep_interval);

    info!(interval = ?state.sweep_interval, "maintenance loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let windows = state.limiters.sweep();
                let sessions = state.users.purge_expired();
                if windows > 0 || sessions > 0 {
                    debug!(windows, sessions, "evicted expired entries");
                }
            }
        }
    }

    info!("maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use clap::Parser;

    #[tokio::test(start_paused = true)]
    async fn maintenance_sweeps_until_shutdown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let args = Args::parse_from(["platform-ops", "--sweep-interval", "1"]);
        let shutdown = CancellationToken::new();
        let state =
            Arc::new(AppState::from_args(&args, clock.clone(), shutdown.clone()).unwrap());

        state.limiters.global.check("10.0.0.1");
        assert_eq!(state.limiters.global.len(), 1);

        let task = tokio::spawn(maintenance(Arc::clone(&state), shutdown.clone()));
        clock.advance(chrono::Duration::seconds(901));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(state.limiters.global.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn empty_environment_list_rejected() {
        let args = Args::parse_from(["platform-ops", "--environments", ","]);
        let result = AppState::from_args(
            &args,
            Arc::new(crate::clock::SystemClock),
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }
}
