//! Background retime pipeline: an unbounded queue of [`RetimeJob`]s
//! drained by a single dispatcher task, with ffmpeg concurrency bounded
//! by a semaphore and failed jobs retried a few times before cleanup.

pub mod ledger;
pub mod retime;

pub use ledger::JobLedger;
pub use retime::RetimeJob;

use crate::app_state::AppState;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::FuturesUnordered;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

enum JobOutcome {
    Done,
    Retry(RetimeJob),
    Failed(RetimeJob),
}

type RunningJob = Pin<Box<dyn Future<Output = (String, JobOutcome)> + Send>>;

/// Spawn the dispatcher task that owns the receiving end of the job
/// channel. It keeps one in-flight future per job id so a job id can
/// never run twice concurrently, even if something re-sends it.
pub(crate) fn spawn_dispatcher(
    state: AppState,
    rx: UnboundedReceiver<RetimeJob>,
    permits: usize,
) {
    info!(permits, "Job dispatcher started");
    let semaphore = Arc::new(Semaphore::new(permits));

    tokio::spawn(async move {
        let rx = std::pin::pin!(rx);
        let mut rx = rx.fuse();

        let mut in_flight: HashSet<String> = HashSet::new();
        let mut running: FuturesUnordered<RunningJob> = FuturesUnordered::new();

        loop {
            debug!("Waiting for job");
            futures::select! {
                maybe_job = rx.next() => {
                    let Some(job) = maybe_job else {
                        error!("Job channel closed, dispatcher finished");
                        break;
                    };

                    let job_id = job.id().to_string();
                    if !in_flight.insert(job_id.clone()) {
                        warn!(job_id, "Job already in-progress, skipping");
                        continue;
                    }

                    let state_c = state.clone();
                    let semaphore_c = semaphore.clone();
                    running.push(Box::pin(async move {
                        let id = job.id().to_string();
                        (id, run_job(job, state_c, semaphore_c).await)
                    }));

                    info!(job_id, "Job added to processing queue");
                }
                (id, outcome) = running.select_next_some() => {
                    in_flight.remove(&id);
                    match outcome {
                        JobOutcome::Done => {
                            info!(id, "Job completed successfully");
                            state.ledger.remove(&id).await;
                            state.call_webhook(&id, "completed").await;
                        }
                        JobOutcome::Retry(job) => {
                            warn!(job_id = %job.id(), "Retrying job");
                            _ = state.job_tx.unbounded_send(job);
                        }
                        JobOutcome::Failed(job) => {
                            info!(id, "Job failed permanently, cleaning up");
                            state.ledger.remove(&id).await;
                            job.cleanup(&state).await;
                            state.call_webhook(&id, "failed").await;
                        }
                    }
                }
            }
        }

        debug!("Job dispatcher finished");
    });
}

async fn run_job(job: RetimeJob, state: AppState, semaphore: Arc<Semaphore>) -> JobOutcome {
    let job_id = job.id().to_string();
    debug!(job_id, "Job waiting for permit");
    let _permit = semaphore
        .acquire()
        .await
        .expect("job semaphore closed unexpectedly");

    info!(job_id, speed = %job.speed, "Job started");

    match job.execute(&state).await {
        Ok(()) => JobOutcome::Done,
        Err(error) => {
            if let Some(retry_interval) = job.wait_for_retry() {
                error!(?error, job_id, "Job failed, waiting for retry");
                tokio::time::sleep(retry_interval).await;
                JobOutcome::Retry(job)
            } else {
                error!(?error, job_id, "Job final failure");
                JobOutcome::Failed(job)
            }
        }
    }
}
