//! Step execution seam for deploy runs.
//!
//! The orchestrator only knows the fixed step order; what a step actually does
//! is up to a [`StepExecutor`]. [`SimulatedExecutor`] stands in for real
//! provisioning with a random delay and an injected failure rate.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// A named unit of the deploy sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub name: &'static str,
    pub description: &'static str,
}

pub const DEPLOY_STEPS: [Step; 6] = [
    Step {
        name: "validation",
        description: "Validating deployment configuration",
    },
    Step {
        name: "preparation",
        description: "Preparing deployment environment",
    },
    Step {
        name: "build",
        description: "Building application",
    },
    Step {
        name: "test",
        description: "Running tests",
    },
    Step {
        name: "deploy",
        description: "Deploying to environment",
    },
    Step {
        name: "verification",
        description: "Verifying deployment",
    },
];

/// What a step body gets to see about its run.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub deployment_id: String,
    pub environment: String,
    pub branch: String,
    pub version: String,
    pub rollback: bool,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step {0} failed")]
    Failed(&'static str),

    #[error("Step {step} timed out after {after:?}")]
    Timeout {
        step: &'static str,
        after: Duration,
    },
}

/// Runs the body of one deploy step.
///
/// Implementations may take as long as they need; cancellation is only
/// observed between steps, so a started step always runs to completion.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<(), StepError>;
}

/// Outcome of checking one environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckReport {
    pub healthy: bool,
    pub response_time: u64, // ms
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: &'static str,
}

pub const HEALTH_CHECKS: [&str; 3] = ["database", "cache", "api"];

/// Checks whether a deployed environment is serving.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, environment: &str) -> HealthCheckReport;
}

// Settings for the simulated executor
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub failure_probability: f64,
    pub unhealthy_probability: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            failure_probability: 0.05,
            unhealthy_probability: 0.1,
            seed: None,
        }
    }
}

impl SimulationConfig {
    // zero delay, never fails, always healthy
    pub fn instant() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            failure_probability: 0.0,
            unhealthy_probability: 0.0,
            seed: Some(0),
        }
    }
}

pub struct SimulatedExecutor {
    min_delay: Duration,
    max_delay: Duration,
    failure_probability: f64,
    unhealthy_probability: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedExecutor {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let max_delay = config.max_delay.max(config.min_delay);
        Self {
            min_delay: config.min_delay,
            max_delay,
            failure_probability: config.failure_probability.clamp(0.0, 1.0),
            unhealthy_probability: config.unhealthy_probability.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    // Draw delay and outcome together so a seed fixes the whole run
    async fn draw(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock().await;
        let delay = if self.max_delay > self.min_delay {
            rng.gen_range(self.min_delay..=self.max_delay)
        } else {
            self.min_delay
        };
        let fails = rng.gen_bool(self.failure_probability);
        (delay, fails)
    }
}

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<(), StepError> {
        let (delay, fails) = self.draw().await;

        tracing::debug!(
            deployment_id = %ctx.deployment_id,
            step = step.name,
            delay_ms = delay.as_millis() as u64,
            "simulating step"
        );

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if fails {
            return Err(StepError::Failed(step.name));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for SimulatedExecutor {
    async fn check(&self, environment: &str) -> HealthCheckReport {
        let (healthy, response_time) = {
            let mut rng = self.rng.lock().await;
            let healthy = !rng.gen_bool(self.unhealthy_probability);
            (healthy, rng.gen_range(50..550))
        };
        tracing::debug!(environment, healthy, response_time, "checked environment health");

        let status = if healthy { "ok" } else { "error" };
        HealthCheckReport {
            healthy,
            response_time,
            checks: HEALTH_CHECKS
                .iter()
                .map(|&name| CheckResult { name, status })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext {
        StepContext {
            deployment_id: "deploy-1-aaaaa".into(),
            environment: "staging".into(),
            branch: "main".into(),
            version: "1.2.3".into(),
            rollback: false,
        }
    }

    #[test]
    fn step_order_is_fixed() {
        let names: Vec<_> = DEPLOY_STEPS.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            ["validation", "preparation", "build", "test", "deploy", "verification"]
        );
    }

    #[tokio::test]
    async fn certain_failure_fails_every_step() {
        let executor = SimulatedExecutor::new(SimulationConfig {
            failure_probability: 1.0,
            ..SimulationConfig::instant()
        });

        let err = executor.execute(&DEPLOY_STEPS[2], &ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "Step build failed");
    }

    #[tokio::test]
    async fn zero_probability_never_fails() {
        let executor = SimulatedExecutor::new(SimulationConfig::instant());
        for step in &DEPLOY_STEPS {
            executor.execute(step, &ctx()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn same_seed_same_outcomes() {
        let config = SimulationConfig {
            failure_probability: 0.5,
            seed: Some(42),
            ..SimulationConfig::instant()
        };
        let a = SimulatedExecutor::new(config.clone());
        let b = SimulatedExecutor::new(config);

        for step in DEPLOY_STEPS.iter().cycle().take(30) {
            let ra = a.execute(step, &ctx()).await.is_ok();
            let rb = b.execute(step, &ctx()).await.is_ok();
            assert_eq!(ra, rb);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_stays_in_range() {
        let executor = SimulatedExecutor::new(SimulationConfig {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            seed: Some(7),
            ..SimulationConfig::instant()
        });

        let started = tokio::time::Instant::now();
        executor.execute(&DEPLOY_STEPS[0], &ctx()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= Duration::from_secs(5) + Duration::from_millis(5));
    }

    #[tokio::test]
    async fn health_check_follows_unhealthy_probability() {
        let sick = SimulatedExecutor::new(SimulationConfig {
            unhealthy_probability: 1.0,
            ..SimulationConfig::instant()
        });
        let report = sick.check("staging").await;
        assert!(!report.healthy);
        assert!(report.checks.iter().all(|c| c.status == "error"));
        assert!((50..550).contains(&report.response_time));

        let fine = SimulatedExecutor::new(SimulationConfig::instant());
        let report = fine.check("staging").await;
        assert!(report.healthy);
        assert_eq!(report.checks.len(), 3);
    }
}
