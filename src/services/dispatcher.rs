//! Bounded-concurrency executor shared by the watcher and the webservice.
//!
//! Jobs enter a single FIFO queue. One dispatch loop takes a slot from the
//! semaphore before it pops the next job, so jobs start in submission order and
//! at most `capacity` engine invocations run at once. Completion order is not ordered.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::models::api::DispatchStats;
use crate::models::job::Job;
use crate::models::result::{ExecutionResult, Failure, FailureKind, Outcome};
use crate::services::engine::{EngineError, OcrEngine};
use crate::services::routing::ResultRouter;

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent engine invocations.
    pub capacity: usize,
    /// Pending-queue bound; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    pub job_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl DispatcherConfig {
    pub fn from_app_config(config: &crate::config::AppConfig) -> Self {
        Self {
            capacity: config.concurrency,
            queue_capacity: config.queue_capacity,
            job_timeout: config.job_timeout(),
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff(),
        }
    }
}

struct Queued {
    job: Job,
    state: Arc<AtomicU8>,
    reply: oneshot::Sender<ExecutionResult>,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Counts one running job for as long as it is alive.
struct InFlight(Arc<Counters>);

impl InFlight {
    fn enter(counters: Arc<Counters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("ocr_jobs_in_flight").set(now as f64);
        Self(counters)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let now = self.0.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("ocr_jobs_in_flight").set(now as f64);
    }
}

struct Worker {
    engine: Arc<dyn OcrEngine>,
    router: Arc<ResultRouter>,
    config: DispatcherConfig,
    counters: Arc<Counters>,
}

pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Queued>,
    counters: Arc<Counters>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn start(engine: Arc<dyn OcrEngine>, router: Arc<ResultRouter>, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let slots = Arc::new(Semaphore::new(config.capacity.max(1)));

        let worker = Arc::new(Worker {
            engine,
            router,
            config: config.clone(),
            counters: counters.clone(),
        });
        tokio::spawn(dispatch_loop(rx, slots, worker));

        tracing::info!(
            capacity = config.capacity,
            queue_capacity = ?config.queue_capacity,
            timeout_secs = config.job_timeout.as_secs(),
            max_attempts = config.max_attempts,
            "Dispatcher started"
        );

        Self {
            tx,
            counters,
            config,
        }
    }

    /// Queue a job. Fails fast when the queue is bounded and full.
    pub fn submit(&self, job: Job) -> Result<JobHandle, SubmitError> {
        let job_id = job.id;

        let reserved = self
            .counters
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| match self.config.queue_capacity {
                Some(limit) if queued >= limit => None,
                _ => Some(queued + 1),
            });
        let depth = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => {
                metrics::counter!("ocr_jobs_rejected_total").increment(1);
                tracing::warn!(job_id = %job_id, "Rejected job: queue full");
                return Err(SubmitError::QueueFull);
            }
        };

        let state = Arc::new(AtomicU8::new(QUEUED));
        let (reply, rx) = oneshot::channel();
        let queued = Queued {
            job,
            state: state.clone(),
            reply,
        };
        if self.tx.send(queued).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(SubmitError::Closed);
        }

        metrics::counter!("ocr_jobs_submitted_total").increment(1);
        metrics::gauge!("ocr_queue_depth").set(depth as f64);
        tracing::debug!(job_id = %job_id, queue_depth = depth, "Job queued");

        Ok(JobHandle {
            job_id,
            state,
            counters: self.counters.clone(),
            rx,
        })
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            capacity: self.config.capacity,
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    slots: Arc<Semaphore>,
    worker: Arc<Worker>,
) {
    while let Some(queued) = rx.recv().await {
        // A cancelled entry already gave back its queue reservation.
        if queued.state.load(Ordering::SeqCst) == CANCELLED {
            reply_cancelled(queued);
            continue;
        }
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if queued
            .state
            .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            reply_cancelled(queued);
            continue;
        }

        let depth = worker.counters.queued.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("ocr_queue_depth").set(depth as f64);

        let worker = worker.clone();
        tokio::spawn(async move { worker.run(queued, permit).await });
    }
    tracing::info!("Dispatcher stopped");
}

fn reply_cancelled(queued: Queued) {
    tracing::info!(job_id = %queued.job.id, "Job cancelled before it started");
    let _ = queued.reply.send(ExecutionResult::not_run(
        queued.job.id,
        Failure::new(FailureKind::Cancelled, "cancelled before start"),
    ));
}

impl Worker {
    async fn run(&self, queued: Queued, _permit: OwnedSemaphorePermit) {
        let Queued { mut job, reply, .. } = queued;

        if !job.source_path.exists() {
            tracing::warn!(job_id = %job.id, source = %job.source_path.display(), "Source vanished, cancelling job");
            let _ = reply.send(ExecutionResult::not_run(
                job.id,
                Failure::new(FailureKind::Cancelled, "source file vanished before start"),
            ));
            return;
        }

        let _in_flight = InFlight::enter(self.counters.clone());
        let result = self.execute(&mut job).await;
        let result = self.finish(&mut job, result);

        if reply.send(result).is_err() {
            tracing::debug!(job_id = %job.id, "Submitter went away before the result was delivered");
        }
    }

    /// Run attempts until success, a permanent failure, or the attempt limit.
    async fn execute(&self, job: &mut Job) -> ExecutionResult {
        let started = Instant::now();
        loop {
            let attempt = match job.begin_attempt() {
                Ok(attempt) => attempt,
                Err(e) => {
                    return ExecutionResult::not_run(job.id, Failure::new(FailureKind::Cancelled, e.to_string()))
                }
            };
            metrics::counter!("ocr_job_attempts_total").increment(1);

            let staged = job.staging_path(attempt);
            tracing::info!(
                job_id = %job.id,
                attempt = attempt,
                source = %job.source_path.display(),
                "Running OCR engine"
            );

            let failure = match self.attempt(job, &staged).await {
                Ok(()) => {
                    return ExecutionResult {
                        job_id: job.id,
                        outcome: Outcome::Succeeded,
                        output_path: None,
                        staged_path: Some(staged),
                        attempts: attempt,
                        duration: started.elapsed(),
                    }
                }
                Err(failure) => failure,
            };

            discard_partial(&staged);

            if failure.kind.is_infrastructure() {
                tracing::error!(job_id = %job.id, attempt = attempt, error = %failure, "Infrastructure failure");
            }

            if failure.kind.is_transient() && attempt < self.config.max_attempts {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = attempt,
                    max_attempts = self.config.max_attempts,
                    error = %failure,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
                continue;
            }

            return ExecutionResult {
                job_id: job.id,
                outcome: Outcome::Failed(failure),
                output_path: None,
                staged_path: None,
                attempts: attempt,
                duration: started.elapsed(),
            };
        }
    }

    async fn attempt(&self, job: &Job, staged: &Path) -> Result<(), Failure> {
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::new(FailureKind::Io, format!("cannot create {}: {e}", parent.display())))?;
        }

        let invocation = self.engine.process(&job.source_path, staged, &job.options);
        match tokio::time::timeout(self.config.job_timeout, invocation).await {
            Ok(Ok(())) if staged.exists() => Ok(()),
            Ok(Ok(())) => Err(Failure::from(EngineError::MissingOutput)),
            Ok(Err(e)) => Err(Failure::from(e)),
            // Dropping the invocation terminates the engine process.
            Err(_) => Err(Failure::timeout(self.config.job_timeout)),
        }
    }

    /// Apply the terminal transition and route the result on disk.
    fn finish(&self, job: &mut Job, mut result: ExecutionResult) -> ExecutionResult {
        if let Err(e) = job.finish(result.outcome.is_success()) {
            tracing::error!(job_id = %job.id, error = %e, "Invalid job transition");
        }

        match self.router.route(job, &result) {
            Ok(output) => {
                result.output_path = output;
                result.staged_path = None;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to route result");
                if result.outcome.is_success() {
                    discard_partial(&job.staging_path(result.attempts));
                }
                result.outcome = Outcome::Failed(Failure::new(FailureKind::Io, e.to_string()));
                result.output_path = None;
                result.staged_path = None;
            }
        }

        let seconds = result.duration.as_secs_f64();
        metrics::histogram!("ocr_job_duration_seconds").record(seconds);
        match &result.outcome {
            Outcome::Succeeded => {
                metrics::counter!("ocr_jobs_succeeded_total").increment(1);
                tracing::info!(
                    job_id = %job.id,
                    attempts = result.attempts,
                    duration_ms = result.duration.as_millis() as u64,
                    output = ?result.output_path,
                    "Job succeeded"
                );
            }
            Outcome::Failed(failure) => {
                metrics::counter!("ocr_jobs_failed_total", "kind" => failure.kind.to_string()).increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    attempts = result.attempts,
                    classification = %failure.kind,
                    error = %failure.message,
                    "Job failed"
                );
            }
        }
        result
    }
}

fn discard_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
    }
}

/// Resolves to the job's `ExecutionResult`.
pub struct JobHandle {
    job_id: Uuid,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
    rx: oneshot::Receiver<ExecutionResult>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Cancel the job if it has not started yet. Returns whether it was cancelled.
    ///
    /// A cancelled job stops counting against the queue bound immediately.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            let depth = self.counters.queued.fetch_sub(1, Ordering::SeqCst) - 1;
            metrics::gauge!("ocr_queue_depth").set(depth as f64);
        }
        cancelled
    }
}

impl Future for JobHandle {
    type Output = ExecutionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let job_id = self.job_id;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                ExecutionResult::not_run(
                    job_id,
                    Failure::new(FailureKind::EngineCrash, "worker stopped before reporting a result"),
                )
            })
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Rejected: queue full")]
    QueueFull,

    #[error("Dispatcher is shut down")]
    Closed,
}
