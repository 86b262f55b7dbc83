use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use platform_ops::clock::SystemClock;
use platform_ops::config::Args;
use platform_ops::router;
use platform_ops::state::{AppState, maintenance};

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // parse cli arguments
    let args = Args::parse();
    init_tracing(args.log_json);

    let shutdown = CancellationToken::new();
    let cancel_on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    // creating shared state, this also spawns the deploy worker
    let state = AppState::from_args(&args, Arc::new(SystemClock), shutdown.clone())
        .map_err(|e| {
            error!(error = %e, "invalid configuration");
            e
        })?;
    let state = Arc::new(state);

    tokio::spawn(maintenance(Arc::clone(&state), shutdown.clone()));

    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let limits = args.rate_limit_config();
    info!(address = %addr, "platform ops API listening");
    info!(
        environments = ?args.deploy_config().environments,
        rollback = !args.disable_rollback,
        auto_deploy = args.auto_deploy,
        "deploy orchestrator ready"
    );
    info!(
        limit = limits.global.max,
        window_secs = limits.global.window.as_secs(),
        "global rate limit"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("platform_ops=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
