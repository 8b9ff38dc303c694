//! Queue workers: claim jobs from the durable job table and run a [`Stage`]
//! on each, with a concurrency cap, lease heartbeat and retry bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use pedia_shared::{PediaError, RateLimitConfig, Result, WorkerConfig};
use pedia_storage::{FailOutcome, JobRecord, Storage};

use crate::queue::QueueName;
use crate::stages::Stage;

/// Runtime settings of one worker pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub rate_limit: Option<RateLimitConfig>,
}

impl WorkerOptions {
    pub fn from_config(worker: &WorkerConfig, poll_interval_ms: u64) -> Self {
        Self {
            concurrency: worker.concurrency.max(1),
            lease: worker.lease(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(limit);
        self
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Sliding-window limiter: at most `max` job starts per `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max: config.max,
            window: Duration::from_millis(config.window_ms),
            starts: VecDeque::new(),
        }
    }

    /// How long to wait at `now` before another start is allowed.
    pub fn delay_at(&mut self, now: Instant) -> Option<Duration> {
        if self.max == 0 {
            return None;
        }
        while let Some(&oldest) = self.starts.front() {
            if now.duration_since(oldest) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() < self.max {
            return None;
        }
        self.starts
            .front()
            .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
    }

    pub fn record_at(&mut self, now: Instant) {
        if self.max > 0 {
            self.starts.push_back(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A running worker pool for one queue.
pub struct WorkerHandle {
    queue: QueueName,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pool to drain after its shutdown token was cancelled.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(queue = %self.queue, error = %e, "worker task panicked");
        }
    }
}

/// Start a worker pool running `stage` against its queue until `shutdown`
/// is cancelled. In-flight jobs are allowed to finish.
pub fn spawn_worker<S: Stage>(
    stage: Arc<S>,
    storage: Arc<Storage>,
    options: WorkerOptions,
    shutdown: CancellationToken,
) -> WorkerHandle {
    let queue = S::QUEUE;
    let span = info_span!("worker", %queue);
    let task = tokio::spawn(run_worker(stage, storage, options, shutdown).instrument(span));
    WorkerHandle { queue, task }
}

async fn run_worker<S: Stage>(
    stage: Arc<S>,
    storage: Arc<Storage>,
    options: WorkerOptions,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let mut limiter = options.rate_limit.as_ref().map(RateLimiter::new);
    let lease_ms = options.lease.as_millis() as u64;
    let mut in_flight = JoinSet::new();

    info!(concurrency = options.concurrency, lease_ms, "worker started");

    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
                continue;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let throttle = limiter
            .as_mut()
            .and_then(|limiter| limiter.delay_at(Instant::now()));
        if let Some(delay) = throttle {
            drop(permit);
            debug!(delay_ms = delay.as_millis() as u64, "rate limited");
            if sleep_or_cancel(delay, &shutdown).await {
                break;
            }
            continue;
        }

        let job = match storage.claim_job(S::QUEUE.as_str(), lease_ms).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                drop(permit);
                if sleep_or_cancel(options.poll_interval, &shutdown).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                drop(permit);
                warn!(error = %e, "claim failed");
                if sleep_or_cancel(options.poll_interval, &shutdown).await {
                    break;
                }
                continue;
            }
        };

        if let Some(limiter) = limiter.as_mut() {
            limiter.record_at(Instant::now());
        }

        let span = info_span!("job", job_id = %job.id, attempt = job.attempts_made);
        in_flight.spawn(
            process_job(stage.clone(), storage.clone(), job, options.lease, permit).instrument(span),
        );
    }

    info!(in_flight = in_flight.len(), "worker draining");
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
    info!("worker stopped");
}

/// Returns `true` if shutdown was requested during the sleep.
async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job task panicked");
    }
}

async fn process_job<S: Stage>(
    stage: Arc<S>,
    storage: Arc<Storage>,
    job: JobRecord,
    lease: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let heartbeat = tokio::spawn(
        heartbeat(storage.clone(), job.id.clone(), lease).instrument(tracing::Span::current()),
    );
    let result = run_stage(stage.as_ref(), &job.payload).await;
    heartbeat.abort();

    match result {
        Ok(output) => {
            let json = serde_json::to_string(&output).unwrap_or_else(|_| "null".into());
            match storage.complete_job(&job.id, &json).await {
                Ok(()) => debug!("job completed"),
                Err(e) => error!(error = %e, "failed to mark job completed"),
            }
        }
        Err(err) => match storage.fail_job(&job.id, &err.to_string()).await {
            Ok(FailOutcome::Retrying { delay_ms }) => {
                warn!(
                    error = %err,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    delay_ms,
                    "job failed, will retry"
                );
            }
            Ok(FailOutcome::Failed) => {
                error!(error = %err, attempts = job.attempts_made, "job failed permanently");
            }
            Err(e) => error!(error = %e, job_error = %err, "failed to record job failure"),
        },
    }
}

async fn run_stage<S: Stage>(stage: &S, payload: &str) -> Result<S::Output> {
    let job: S::Job = serde_json::from_str(payload)
        .map_err(|e| PediaError::parse(format!("invalid {} payload: {e}", S::QUEUE)))?;
    stage.handle(job).await
}

/// Renew the job's lease every half lease until aborted.
async fn heartbeat(storage: Arc<Storage>, job_id: String, lease: Duration) {
    let lease_ms = lease.as_millis() as u64;
    let mut ticker = tokio::time::interval((lease / 2).max(Duration::from_millis(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match storage.renew_lease(&job_id, lease_ms).await {
            Ok(true) => debug!("lease renewed"),
            Ok(false) => {
                warn!("lease lost, job no longer active");
                break;
            }
            Err(e) => warn!(error = %e, "lease renewal failed"),
        }
    }
}
