mod auth;
mod deploy;
mod health;
mod metrics;

pub use auth::{
    change_password_handler, login_handler, logout_handler, me_handler, refresh_handler,
    verify_handler,
};
pub use deploy::{
    deploy_health_handler, history_handler, logs_handler, rollback_handler, start_handler,
    status_handler, stop_handler, webhook_handler,
};
pub use health::{health_handler, live_handler, ready_handler};
pub use metrics::metrics_handler;
