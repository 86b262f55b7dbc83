use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::deploy::{DeployJob, DeployOrchestrator};
use crate::executor::{DEPLOY_STEPS, StepError, StepExecutor};

// Deploy worker - runs accepted deployments one at a time, in queue order
pub async fn deploy_worker(
    orchestrator: DeployOrchestrator,
    mut rx: mpsc::Receiver<DeployJob>,
    executor: Arc<dyn StepExecutor>,
    shutdown: CancellationToken,
) {
    info!("deploy worker started");

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let id = job.id.clone();

        // own task per run: a panicking step must not take the worker down
        let run = tokio::spawn(execute_run(
            orchestrator.clone(),
            Arc::clone(&executor),
            job,
        ));

        if let Err(e) = run.await {
            error!(deployment_id = %id, error = %e, "deploy execution aborted");
            orchestrator
                .fail(&id, format!("Deploy execution aborted: {e}"))
                .await;
        }
    }

    info!("deploy worker stopped");
}

async fn execute_run(
    orchestrator: DeployOrchestrator,
    executor: Arc<dyn StepExecutor>,
    job: DeployJob,
) {
    let Some(ctx) = orchestrator.context(&job.id).await else {
        debug!(deployment_id = %job.id, "run no longer active, skipping");
        return;
    };

    if !orchestrator
        .record_step(&job.id, "started", "Deploy started")
        .await
    {
        return;
    }

    let step_timeout = orchestrator.config().step_timeout;

    for step in &DEPLOY_STEPS {
        // cancellation is only honoured between steps
        if job.cancel.is_cancelled() {
            info!(deployment_id = %job.id, next_step = step.name, "stopping cancelled deploy");
            return;
        }

        if !orchestrator
            .record_step(&job.id, step.name, step.description)
            .await
        {
            return;
        }

        let result = match step_timeout {
            Some(limit) => tokio::time::timeout(limit, executor.execute(step, &ctx))
                .await
                .unwrap_or(Err(StepError::Timeout {
                    step: step.name,
                    after: limit,
                })),
            None => executor.execute(step, &ctx).await,
        };

        match result {
            Ok(()) => {
                debug!(deployment_id = %job.id, step = step.name, "step completed");
                if !orchestrator
                    .record_log(&job.id, format!("{} completed", step.description))
                    .await
                {
                    return;
                }
            }
            Err(e) => {
                orchestrator.fail(&job.id, e.to_string()).await;
                return;
            }
        }
    }

    if job.cancel.is_cancelled() {
        return;
    }
    orchestrator.complete(&job.id).await;
}
