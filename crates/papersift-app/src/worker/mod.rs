//! The worker pool: claim loops that feed the pipeline engine, plus a
//! janitor that returns orphaned work to the queue after a worker dies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::pipeline::{EngineOutcome, LEASE_DURATION, PipelineEngine};
use crate::services::Services;
use crate::store::NackOutcome;

/// Processing rows whose heartbeat is older than this are presumed orphaned.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
const CLAIM_WAIT: Duration = Duration::from_secs(5);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Run `worker_concurrency` claim loops and the janitor until the shutdown
/// signal flips. In-flight documents drain before the pool returns.
pub async fn run_pool(services: Arc<Services>, shutdown: watch::Receiver<bool>) {
    let concurrency = services.config.processing.worker_concurrency;
    let process_id = std::process::id();
    tracing::info!(concurrency, "worker pool starting");

    let mut tasks = JoinSet::new();
    for slot in 0..concurrency {
        let worker_id = format!("worker-{process_id}-{slot}");
        let services = services.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            worker_loop(services, worker_id, shutdown).await;
        });
    }
    {
        let services = services.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            janitor_loop(services, shutdown).await;
        });
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            tracing::error!(error = %err, "worker task panicked");
        }
    }
    tracing::info!("worker pool stopped");
}

async fn worker_loop(
    services: Arc<Services>,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let engine = PipelineEngine::new(services.clone(), worker_id.clone());
    tracing::debug!(worker = %worker_id, "claim loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let claimed = tokio::select! {
            _ = shutdown.changed() => break,
            result = services
                .meta
                .claim_job_blocking(&worker_id, LEASE_DURATION, CLAIM_WAIT) =>
            {
                match result {
                    Ok(Some(claimed)) => claimed,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(worker = %worker_id, error = %err, "claim failed");
                        sleep(ERROR_PAUSE).await;
                        continue;
                    }
                }
            }
        };

        let outcome = engine.run(&claimed).await;
        settle(&services, &claimed.lease_token, outcome);
    }
    tracing::debug!(worker = %worker_id, "claim loop stopped");
}

/// Map an engine outcome onto queue acknowledgements. Terminal outcomes ack;
/// transient ones nack with a delay and mark the document failed once the
/// delivery budget runs out.
fn settle(services: &Services, lease_token: &str, outcome: EngineOutcome) {
    match outcome {
        EngineOutcome::Completed { .. } | EngineOutcome::Failed { .. } => {
            ack(services, lease_token);
        }
        EngineOutcome::Skipped { document_id } => {
            tracing::debug!(document_id, "acking stale delivery");
            ack(services, lease_token);
        }
        EngineOutcome::Cancelled { document_id } => {
            ack(services, lease_token);
            if let Err(err) = services.meta.clear_tombstone(document_id) {
                tracing::warn!(document_id, error = %err, "failed to clear tombstone");
            }
        }
        EngineOutcome::Retry {
            document_id,
            delay,
            message,
            ..
        } => match services.meta.nack_job(lease_token, Some(delay)) {
            Ok(NackOutcome::Requeued { attempt }) => {
                tracing::info!(document_id, attempt, "job requeued");
            }
            Ok(NackOutcome::Exhausted { document_id }) => {
                let error = format!("retry budget exhausted: {message}");
                match services.meta.fail_document(document_id, None, &error, None) {
                    Ok(true) => {
                        if let Ok(Some(fresh)) = services.meta.get_document(document_id) {
                            services.progress.publish(fresh.snapshot());
                        }
                        tracing::warn!(document_id, "document failed after final attempt");
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::error!(document_id, error = %err, "failed to mark document");
                    }
                }
            }
            Ok(NackOutcome::UnknownToken) => {
                tracing::warn!(document_id, "lease token vanished before nack");
            }
            Err(err) => {
                tracing::error!(document_id, error = %err, "nack failed");
            }
        },
    }
}

fn ack(services: &Services, lease_token: &str) {
    if let Err(err) = services.meta.ack_job(lease_token) {
        tracing::error!(error = %err, "ack failed");
    }
}

/// Periodically put documents orphaned by dead workers back into rotation.
async fn janitor_loop(services: Arc<Services>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..5_000));
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(JANITOR_INTERVAL + jitter) => {}
        }
        if *shutdown.borrow() {
            break;
        }
        match services
            .meta
            .reset_stale_processing(HEARTBEAT_TIMEOUT.as_millis() as i64)
        {
            Ok(reset) if !reset.is_empty() => {
                tracing::warn!(documents = ?reset, "janitor reset stale processing rows");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "janitor sweep failed");
            }
        }
    }
}
