pub mod job;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::QueueConfig;
use crate::error::Result;

pub use job::{
    Job, NotificationRecord, SummaryJobData, JOB_GENERATE, JOB_NOTIFICATION, JOB_REGENERATE,
    QUEUE_NOTIFY, QUEUE_SUMMARY,
};
pub use store::QueueRepository;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// A consumer of one named queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The queue this handler drains.
    fn queue(&self) -> &'static str;

    /// Process one claimed job. An `Ok` acknowledges the job; an `Err` feeds
    /// the retry/dead-letter machinery according to its retryability.
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Run a bounded pool of workers for one handler until shutdown.
///
/// Each worker polls for a claimable job; claims are exclusive, so `n`
/// workers process at most `n` jobs of the queue concurrently.
pub async fn run_worker_pool(
    queue: QueueRepository,
    config: QueueConfig,
    handler: Arc<dyn JobHandler>,
    shutdown: broadcast::Sender<()>,
) {
    let queue_name = handler.queue();
    let mut workers = Vec::with_capacity(config.concurrency);

    for worker_id in 0..config.concurrency {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        let mut shutdown_rx = shutdown.subscribe();
        let poll_interval = Duration::from_millis(config.poll_interval_ms);

        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(queue = queue_name, worker = worker_id, "Worker shutting down");
                        break;
                    }
                    claimed = queue.claim_next(queue_name) => {
                        match claimed {
                            Ok(Some(job)) => run_one(&queue, handler.as_ref(), &job).await,
                            Ok(None) => tokio::time::sleep(poll_interval).await,
                            Err(e) => {
                                tracing::error!(queue = queue_name, error = %e, "Failed to claim job");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                }
            }
        }));
    }

    tracing::info!(
        queue = queue_name,
        concurrency = config.concurrency,
        "Worker pool started"
    );

    for worker in workers {
        let _ = worker.await;
    }
}

async fn run_one(queue: &QueueRepository, handler: &dyn JobHandler, job: &Job) {
    tracing::info!(queue = %job.queue, job = %job.name, id = %job.id, attempt = job.attempts, "Processing job");

    match handler.handle(job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(&job.id).await {
                tracing::error!(id = %job.id, error = %e, "Failed to acknowledge job");
            }
        }
        Err(e) => {
            let retryable = e.is_retryable();
            if let Err(store_err) = queue.fail(job, &e.to_string(), retryable).await {
                tracing::error!(id = %job.id, error = %store_err, "Failed to record job failure");
            }
        }
    }
}

/// Periodic queue upkeep: requeue stalled leases and enforce retention.
pub async fn run_maintenance(
    queue: QueueRepository,
    config: QueueConfig,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                if let Err(e) = queue.requeue_stalled(config.stall_timeout_secs).await {
                    tracing::error!(error = %e, "Failed to requeue stalled jobs");
                }
                if let Err(e) = queue.cleanup().await {
                    tracing::error!(error = %e, "Queue cleanup failed");
                }
            }
        }
    }
}

/// Drain helper for tests and synchronous call sites: claim and process jobs
/// from the handler's queue until it is empty.
pub async fn drain_queue(queue: &QueueRepository, handler: &dyn JobHandler) -> Result<usize> {
    let mut processed = 0;
    while let Some(job) = queue.claim_next(handler.queue()).await? {
        run_one(queue, handler, &job).await;
        processed += 1;
    }
    Ok(processed)
}
