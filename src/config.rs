use clap::Parser;
use std::time::Duration;

use crate::auth::{User, UserDirectory, parse_user_spec};
use crate::deploy::DeployConfig;
use crate::executor::SimulationConfig;
use crate::rate_limit::{LimiterConfig, RateLimitConfig};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "platform-ops")]
#[command(about = "Operations API: rate-limited deploy orchestration")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "API_PORT", default_value_t = 3000)]
    pub port: u16,

    // Global rate limit: max requests per window, per client IP (0 disables)
    #[arg(long, env = "RATE_LIMIT", default_value_t = 100)]
    pub rate_limit: u32,

    // Global rate limit window in seconds
    #[arg(long, env = "RATE_WINDOW", default_value_t = 900)]
    pub rate_window: u64,

    #[arg(long, default_value_t = 5)]
    pub strict_rate_limit: u32,

    #[arg(long, default_value_t = 900)]
    pub strict_rate_window: u64,

    // Failed login attempts per IP
    #[arg(long, default_value_t = 10)]
    pub login_rate_limit: u32,

    #[arg(long, default_value_t = 900)]
    pub login_rate_window: u64,

    // Per authenticated user
    #[arg(long, default_value_t = 30)]
    pub user_rate_limit: u32,

    #[arg(long, default_value_t = 60)]
    pub user_rate_window: u64,

    // Per X-API-Key
    #[arg(long, default_value_t = 60)]
    pub api_rate_limit: u32,

    #[arg(long, default_value_t = 60)]
    pub api_rate_window: u64,

    // Deploy/rollback requests per IP
    #[arg(long, default_value_t = 3)]
    pub deploy_rate_limit: u32,

    #[arg(long, default_value_t = 300)]
    pub deploy_rate_window: u64,

    // Key rate limits on X-Forwarded-For / X-Real-IP; only behind a proxy that sets them
    #[arg(long, env = "TRUST_PROXY")]
    pub trust_proxy: bool,

    // How often expired rate limit entries are evicted, in seconds
    #[arg(long, default_value_t = 60)]
    pub sweep_interval: u64,

    // Known environments (comma-separated)
    #[arg(
        long,
        env = "DEPLOY_ENVIRONMENTS",
        value_delimiter = ',',
        default_value = "development,staging,production"
    )]
    pub environments: Vec<String>,

    #[arg(long, env = "DISABLE_ROLLBACK")]
    pub disable_rollback: bool,

    #[arg(long, env = "AUTO_DEPLOY")]
    pub auto_deploy: bool,

    // Branch the push webhook deploys
    #[arg(long, env = "DEPLOY_BRANCH", default_value = "main")]
    pub deploy_branch: String,

    // Simulated step duration range in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub step_delay_min_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub step_delay_max_ms: u64,

    // Chance that a simulated step fails, 0.0..=1.0
    #[arg(long, default_value_t = 0.05, value_parser = parse_probability)]
    pub failure_probability: f64,

    // Chance that a simulated environment health check reports unhealthy
    #[arg(long, default_value_t = 0.1, value_parser = parse_probability)]
    pub unhealthy_probability: f64,

    // Seed for the simulated executor, random when unset
    #[arg(long)]
    pub seed: Option<u64>,

    // Per-step timeout in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    pub step_timeout: u64,

    // Deployments kept in memory
    #[arg(long, default_value_t = 1000)]
    pub history_limit: usize,

    // Users as name:password:role+role, replaces the built-in accounts
    #[arg(long = "user")]
    pub users: Vec<String>,

    #[arg(long, default_value_t = 24)]
    pub token_ttl_hours: i64,

    // Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let p: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{p} is not between 0 and 1"))
    }
}

impl Args {
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let defaults = RateLimitConfig::default();
        let limiter = |base: LimiterConfig, max: u32, window: u64| LimiterConfig {
            max,
            window: Duration::from_secs(window),
            ..base
        };

        RateLimitConfig {
            global: limiter(defaults.global, self.rate_limit, self.rate_window),
            strict: limiter(defaults.strict, self.strict_rate_limit, self.strict_rate_window),
            login: limiter(defaults.login, self.login_rate_limit, self.login_rate_window),
            user: limiter(defaults.user, self.user_rate_limit, self.user_rate_window),
            api: limiter(defaults.api, self.api_rate_limit, self.api_rate_window),
            deploy: limiter(defaults.deploy, self.deploy_rate_limit, self.deploy_rate_window),
            sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
        }
    }

    pub fn deploy_config(&self) -> DeployConfig {
        let environments = self
            .environments
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        DeployConfig {
            environments,
            rollback_enabled: !self.disable_rollback,
            auto_deploy: self.auto_deploy,
            deploy_branch: self.deploy_branch.clone(),
            max_history: self.history_limit.max(1),
            step_timeout: (self.step_timeout > 0).then(|| Duration::from_secs(self.step_timeout)),
            ..DeployConfig::default()
        }
    }

    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            min_delay: Duration::from_millis(self.step_delay_min_ms),
            max_delay: Duration::from_millis(self.step_delay_max_ms),
            failure_probability: self.failure_probability,
            unhealthy_probability: self.unhealthy_probability,
            seed: self.seed,
        }
    }

    pub fn users(&self) -> Result<Vec<User>, String> {
        if self.users.is_empty() {
            return UserDirectory::default_users().map_err(|e| e.to_string());
        }
        self.users
            .iter()
            .enumerate()
            .map(|(i, spec)| parse_user_spec(i as u32 + 1, spec))
            .collect()
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_ttl_hours.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_builtin_limits() {
        let args = Args::parse_from(["platform-ops"]);
        let limits = args.rate_limit_config();
        assert_eq!(limits.global.max, 100);
        assert_eq!(limits.global.window, Duration::from_secs(900));
        assert_eq!(limits.deploy.max, 3);
        assert_eq!(limits.deploy.name, "deploy");

        let deploy = args.deploy_config();
        assert_eq!(deploy.environments, ["development", "staging", "production"]);
        assert!(deploy.rollback_enabled);
        assert!(deploy.step_timeout.is_none());
        assert_eq!(args.users().unwrap().len(), 3);
        assert!(!args.trust_proxy);
    }

    #[test]
    fn overrides() {
        let args = Args::parse_from([
            "platform-ops",
            "--environments",
            "dev, prod",
            "--disable-rollback",
            "--step-timeout",
            "30",
            "--user",
            "ci:pw:operator",
        ]);
        let deploy = args.deploy_config();
        assert_eq!(deploy.environments, ["dev", "prod"]);
        assert!(!deploy.rollback_enabled);
        assert_eq!(deploy.step_timeout, Some(Duration::from_secs(30)));
        assert_eq!(args.users().unwrap()[0].username, "ci");
    }

    #[test]
    fn probability_out_of_range_rejected() {
        assert!(Args::try_parse_from(["platform-ops", "--failure-probability", "1.5"]).is_err());
    }
}
