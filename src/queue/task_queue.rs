//! FIFO admission queue in front of the single execution worker

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::pipeline::GenerationPipeline;
use crate::queue::job::{JobDescriptor, JobId};
use crate::queue::result::ResultRecord;
use crate::queue::worker::ExecutionWorker;

/// Configuration for the task queue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Maximum number of admitted jobs not yet completed (queued + running)
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// How long a caller waits for its result, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_pending() -> usize {
    100
}

fn default_timeout_ms() -> u64 {
    600_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// A job travelling from admission to the worker
pub(crate) struct QueuedJob {
    pub(crate) job: JobDescriptor,
    pub(crate) response_tx: oneshot::Sender<ResultRecord>,
    pub(crate) enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    pending: usize,
    processed: u64,
    running: Option<JobId>,
}

/// Counters shared between admission and the worker, behind one lock
#[derive(Debug)]
pub(crate) struct QueueState {
    counters: Mutex<Counters>,
    capacity: usize,
}

impl QueueState {
    fn new(capacity: usize) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            capacity,
        }
    }

    pub(crate) fn mark_running(&self, job_id: JobId) {
        self.counters.lock().running = Some(job_id);
    }

    /// Release the admission slot of a completed or skipped job
    pub(crate) fn mark_finished(&self) -> usize {
        let mut counters = self.counters.lock();
        counters.pending = counters.pending.saturating_sub(1);
        counters.processed += 1;
        counters.running = None;
        counters.pending
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processed: u64,
    pub capacity: usize,
    pub running: Option<JobId>,
}

/// Admission queue for generation jobs.
///
/// Any number of producers may call [`enqueue`](Self::enqueue); exactly one
/// [`ExecutionWorker`] consumes, in admission order.
pub struct TaskQueue {
    job_tx: mpsc::UnboundedSender<QueuedJob>,
    state: Arc<QueueState>,
    config: QueueConfig,
}

impl TaskQueue {
    /// Create the queue and spawn its worker, which takes ownership of the
    /// pipeline. Must be called from within a tokio runtime.
    pub fn start(pipeline: Box<dyn GenerationPipeline>, config: QueueConfig) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::new(config.max_pending));

        let worker = ExecutionWorker::new(pipeline, job_rx, state.clone());
        tokio::spawn(worker.run());

        Self {
            job_tx,
            state,
            config,
        }
    }

    /// Admit a job. Returns immediately with a handle for the result, or
    /// `QueueFull` when `max_pending` jobs are already admitted.
    pub fn enqueue(&self, job: JobDescriptor) -> Result<JobHandle> {
        let job_id = job.id();
        let (response_tx, response_rx) = oneshot::channel();

        // The send happens under the lock so admission order equals queue order
        let mut counters = self.state.counters.lock();
        if counters.pending >= self.state.capacity {
            warn!(%job_id, capacity = self.state.capacity, "Rejecting job, queue is full");
            return Err(AppError::QueueFull {
                capacity: self.state.capacity,
            });
        }

        self.job_tx
            .send(QueuedJob {
                job,
                response_tx,
                enqueued_at: Instant::now(),
            })
            .map_err(|_| AppError::WorkerUnavailable)?;
        counters.pending += 1;
        let pending = counters.pending;
        drop(counters);

        debug!(%job_id, pending, "Job queued");

        Ok(JobHandle {
            job_id,
            response_rx,
            timeout: Duration::from_millis(self.config.timeout_ms),
        })
    }

    /// Get the number of admitted jobs not yet completed
    pub fn pending_count(&self) -> usize {
        self.state.counters.lock().pending
    }

    /// Get the number of jobs the worker has finished or skipped
    pub fn processed_count(&self) -> u64 {
        self.state.counters.lock().processed
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let counters = self.state.counters.lock();
        QueueStats {
            pending: counters.pending,
            processed: counters.processed,
            capacity: self.state.capacity,
            running: counters.running,
        }
    }
}

/// Ticket for one admitted job.
///
/// Dropping the handle tells the worker nobody is waiting: a job that has not
/// started yet is skipped, a running one stops at its next step checkpoint.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    response_rx: oneshot::Receiver<ResultRecord>,
    timeout: Duration,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Override the wait deadline taken from the queue configuration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for the result record until the deadline
    pub async fn wait(self) -> Result<ResultRecord> {
        self.wait_or_cancel(std::future::pending()).await
    }

    /// Wait for the result record until the deadline or until `cancel`
    /// resolves, whichever comes first.
    ///
    /// Giving up only unblocks the caller; the job stays admitted until the
    /// worker has dealt with it.
    pub async fn wait_or_cancel<F>(self, cancel: F) -> Result<ResultRecord>
    where
        F: Future<Output = ()>,
    {
        let JobHandle {
            job_id,
            response_rx,
            timeout,
        } = self;

        tokio::select! {
            result = tokio::time::timeout(timeout, response_rx) => match result {
                Ok(Ok(record)) => Ok(record),
                Ok(Err(_)) => Err(AppError::WorkerUnavailable),
                Err(_) => {
                    warn!(%job_id, timeout_ms = timeout.as_millis() as u64, "Gave up waiting for job");
                    Err(AppError::Timeout(format!(
                        "Job {} did not finish within {} ms",
                        job_id,
                        timeout.as_millis()
                    )))
                }
            },
            _ = cancel => {
                debug!(%job_id, "Caller cancelled wait");
                Err(AppError::Cancelled(job_id))
            }
        }
    }
}
