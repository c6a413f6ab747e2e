//! The execution worker: sole consumer of the queue and sole owner of the
//! generation pipeline

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::pipeline::{GenerationContext, GenerationPipeline, PipelineError};
use crate::queue::job::JobDescriptor;
use crate::queue::result::{FinishReason, ResultRecord};
use crate::queue::task_queue::{QueueState, QueuedJob};

pub(crate) struct ExecutionWorker {
    pipeline: Box<dyn GenerationPipeline>,
    job_rx: mpsc::UnboundedReceiver<QueuedJob>,
    state: Arc<QueueState>,
}

impl ExecutionWorker {
    pub(crate) fn new(
        pipeline: Box<dyn GenerationPipeline>,
        job_rx: mpsc::UnboundedReceiver<QueuedJob>,
        state: Arc<QueueState>,
    ) -> Self {
        Self {
            pipeline,
            job_rx,
            state,
        }
    }

    /// Run until every queue handle has been dropped. Each job is driven to
    /// completion before the next one is received.
    pub(crate) async fn run(mut self) {
        info!(pipeline = self.pipeline.name(), "Execution worker started");

        while let Some(queued) = self.job_rx.recv().await {
            self.process(queued).await;
        }

        info!("Execution worker stopped");
    }

    async fn process(&mut self, queued: QueuedJob) {
        let QueuedJob {
            job,
            response_tx,
            enqueued_at,
        } = queued;
        let job_id = job.id();

        if response_tx.is_closed() {
            let pending = self.state.mark_finished();
            info!(%job_id, pending, "Caller left before the job started, skipping");
            return;
        }

        let waited_ms = enqueued_at.elapsed().as_millis() as u64;
        info!(
            %job_id,
            kind = job.kind().name(),
            images = job.image_number(),
            received_at = %job.received_at(),
            waited_ms,
            "Job started"
        );
        self.state.mark_running(job_id);

        let record = self.execute(&job, &response_tx).await;
        let pending = self.state.mark_finished();

        info!(
            %job_id,
            finish_reason = %record.finish_reason(),
            images = record.images().len(),
            elapsed_ms = record.elapsed().as_millis() as u64,
            pending,
            "Job finished"
        );

        if response_tx.send(record).is_err() {
            debug!(%job_id, "Nobody is waiting for the result, discarding it");
        }
    }

    async fn execute(
        &mut self,
        job: &JobDescriptor,
        response_tx: &oneshot::Sender<ResultRecord>,
    ) -> ResultRecord {
        let started = Instant::now();
        let base_seed = job.params().seed.resolve(&mut rand::thread_rng());
        debug!(job_id = %job.id(), base_seed, "Seed resolved");

        let cancel_probe = || response_tx.is_closed();
        let mut ctx = GenerationContext::new(job.image_number(), base_seed, &cancel_probe);

        let outcome = AssertUnwindSafe(self.pipeline.generate(job, &mut ctx))
            .catch_unwind()
            .await;

        let (finish_reason, detail) = match outcome {
            Ok(Ok(())) => (FinishReason::Success, None),
            Ok(Err(PipelineError::Interrupted)) => {
                info!(job_id = %job.id(), completed = ctx.completed(), "Job interrupted by caller");
                (FinishReason::UserCancel, None)
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id(), completed = ctx.completed(), error = %e, "Pipeline failed");
                (FinishReason::ProcessingError, Some(e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job.id(), completed = ctx.completed(), panic = %message, "Pipeline panicked");
                (FinishReason::ProcessingError, Some(message))
            }
        };

        ResultRecord::new(
            job.id(),
            ctx.into_images(),
            finish_reason,
            detail,
            started.elapsed(),
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("pipeline panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("pipeline panicked: {}", message)
    } else {
        "pipeline panicked".to_string()
    }
}
