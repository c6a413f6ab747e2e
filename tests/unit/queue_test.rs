//! Unit tests for the admission queue and execution worker

use async_trait::async_trait;
use fooocus_gateway::error::AppError;
use fooocus_gateway::config::PipelineConfig;
use fooocus_gateway::pipeline::{
    GenerationContext, GenerationPipeline, PipelineError, ProceduralPipeline,
};
use fooocus_gateway::queue::job::{
    AspectRatio, GenerationParams, JobDescriptor, JobId, JobKind, SeedPolicy, MAX_SEED,
};
use fooocus_gateway::queue::{FinishReason, QueueConfig, TaskQueue};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Shared observations of a stub pipeline
#[derive(Default)]
struct Observed {
    completed: Mutex<Vec<JobId>>,
    seeds: Mutex<Vec<u64>>,
    /// Images emitted per run and whether the run was interrupted
    outcomes: Mutex<Vec<(usize, bool)>>,
    active: AtomicBool,
    violations: AtomicUsize,
}

/// Scripted pipeline with a reentrancy guard
#[derive(Default)]
struct StubPipeline {
    observed: Arc<Observed>,
    delay: Duration,
    fail_after: Option<usize>,
    panic_after: Option<usize>,
    gate: Option<Arc<Semaphore>>,
}

impl StubPipeline {
    async fn run(
        &mut self,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<(), PipelineError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        for index in 0..ctx.requested() {
            if self.fail_after == Some(index) {
                return Err(PipelineError::Model("boom".to_string()));
            }
            if self.panic_after == Some(index) {
                panic!("kaboom");
            }
            ctx.checkpoint()?;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            ctx.emit(RgbImage::from_pixel(2, 2, Rgb([index as u8, 0, 0])))?;
        }

        self.observed.seeds.lock().push(ctx.base_seed());
        Ok(())
    }
}

#[async_trait]
impl GenerationPipeline for StubPipeline {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(
        &mut self,
        job: &JobDescriptor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<(), PipelineError> {
        if self.observed.active.swap(true, Ordering::SeqCst) {
            self.observed.violations.fetch_add(1, Ordering::SeqCst);
        }

        let result = self.run(ctx).await;

        let interrupted = matches!(result, Err(PipelineError::Interrupted));
        self.observed.outcomes.lock().push((ctx.completed(), interrupted));
        self.observed.active.store(false, Ordering::SeqCst);
        self.observed.completed.lock().push(job.id());
        result
    }
}

fn job(images: u32, seed: SeedPolicy) -> JobDescriptor {
    let params = GenerationParams {
        prompt: "test".to_string(),
        image_number: images,
        seed,
        ..GenerationParams::default()
    };
    JobDescriptor::new(JobKind::TextToImage, params, false).unwrap()
}

fn config(max_pending: usize) -> QueueConfig {
    QueueConfig {
        max_pending,
        timeout_ms: 10_000,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}

#[test]
fn test_queue_config_defaults() {
    let config = QueueConfig::default();

    assert_eq!(config.max_pending, 100);
    assert_eq!(config.timeout_ms, 600_000);
}

#[tokio::test]
async fn test_completion_order_matches_enqueue_order() {
    let observed = Arc::new(Observed::default());
    let pipeline = StubPipeline {
        observed: observed.clone(),
        delay: Duration::from_millis(2),
        ..StubPipeline::default()
    };
    let queue = Arc::new(TaskQueue::start(Box::new(pipeline), config(32)));
    let enqueued = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let mut producers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let enqueued = enqueued.clone();
        producers.push(tokio::spawn(async move {
            let mut handles = Vec::new();
            for _ in 0..3 {
                // Record under a lock so the recorded order is the admission order
                let mut order = enqueued.lock().await;
                let handle = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
                order.push(handle.job_id());
                drop(order);
                handles.push(handle);
                tokio::task::yield_now().await;
            }
            for handle in handles {
                let record = handle.wait().await.unwrap();
                assert_eq!(record.finish_reason(), FinishReason::Success);
            }
        }));
    }

    for producer in producers {
        producer.await.unwrap();
    }

    let expected = enqueued.lock().await.clone();
    assert_eq!(expected.len(), 12);
    assert_eq!(*observed.completed.lock(), expected);
}

#[tokio::test]
async fn test_pipeline_is_never_entered_concurrently() {
    let observed = Arc::new(Observed::default());
    let pipeline = StubPipeline {
        observed: observed.clone(),
        delay: Duration::from_millis(1),
        ..StubPipeline::default()
    };
    let queue = Arc::new(TaskQueue::start(Box::new(pipeline), config(32)));

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let queue = queue.clone();
        waiters.push(tokio::spawn(async move {
            let handle = queue.enqueue(job(2, SeedPolicy::Random)).unwrap();
            handle.wait().await.unwrap()
        }));
    }

    for waiter in waiters {
        let record = waiter.await.unwrap();
        assert_eq!(record.images().len(), 2);
    }

    assert_eq!(observed.violations.load(Ordering::SeqCst), 0);
    assert_eq!(observed.completed.lock().len(), 10);
}

#[tokio::test]
async fn test_admission_rejects_beyond_capacity() {
    let gate = Arc::new(Semaphore::new(0));
    let pipeline = StubPipeline {
        gate: Some(gate.clone()),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(2));

    let first = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    let second = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    let rejected = queue.enqueue(job(1, SeedPolicy::Random));

    assert!(matches!(rejected, Err(AppError::QueueFull { capacity: 2 })));
    assert_eq!(queue.pending_count(), 2);

    gate.add_permits(2);
    assert_eq!(first.wait().await.unwrap().finish_reason(), FinishReason::Success);
    assert_eq!(second.wait().await.unwrap().finish_reason(), FinishReason::Success);

    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.processed_count(), 2);

    gate.add_permits(1);
    let again = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    assert!(again.wait().await.is_ok());
}

#[tokio::test]
async fn test_pipeline_failure_keeps_partial_images() {
    let pipeline = StubPipeline {
        fail_after: Some(2),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let record = queue
        .enqueue(job(4, SeedPolicy::Fixed(100)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(record.finish_reason(), FinishReason::ProcessingError);
    assert!(record.detail().unwrap().contains("boom"));
    assert_eq!(record.images().len(), 2);
    assert!(record
        .images()
        .iter()
        .all(|image| image.finish_reason == FinishReason::Success));
    assert_eq!(record.images()[0].seed, 100);
    assert_eq!(record.images()[1].seed, 101);
}

#[tokio::test]
async fn test_failure_before_first_image_yields_empty_record() {
    let pipeline = StubPipeline {
        fail_after: Some(0),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let record = queue
        .enqueue(job(3, SeedPolicy::Random))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(record.finish_reason(), FinishReason::ProcessingError);
    assert!(record.images().is_empty());
}

#[tokio::test]
async fn test_pipeline_panic_is_contained() {
    let pipeline = StubPipeline {
        panic_after: Some(1),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let record = queue
        .enqueue(job(3, SeedPolicy::Random))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(record.finish_reason(), FinishReason::ProcessingError);
    assert!(record.detail().unwrap().contains("kaboom"));
    assert_eq!(record.images().len(), 1);

    // The worker survives and keeps serving
    let next = queue
        .enqueue(job(1, SeedPolicy::Random))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(next.finish_reason(), FinishReason::Success);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn test_random_seed_is_resolved_and_recorded() {
    let observed = Arc::new(Observed::default());
    let pipeline = StubPipeline {
        observed: observed.clone(),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let record = queue
        .enqueue(job(3, SeedPolicy::Random))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let seeds: Vec<u64> = record.images().iter().map(|image| image.seed).collect();
    assert_eq!(seeds.len(), 3);
    assert_eq!(seeds[0], observed.seeds.lock()[0]);
    assert!(seeds.iter().all(|seed| *seed <= MAX_SEED));
    assert_eq!(seeds[1], (seeds[0] + 1) & MAX_SEED);
    assert_eq!(seeds[2], (seeds[0] + 2) & MAX_SEED);
}

#[tokio::test]
async fn test_timeout_unblocks_waiter_but_job_still_completes() {
    let gate = Arc::new(Semaphore::new(0));
    let observed = Arc::new(Observed::default());
    let pipeline = StubPipeline {
        observed: observed.clone(),
        gate: Some(gate.clone()),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let result = queue
        .enqueue(job(1, SeedPolicy::Random))
        .unwrap()
        .with_timeout(Duration::from_millis(30))
        .wait()
        .await;

    assert!(matches!(result, Err(AppError::Timeout(_))));
    assert_eq!(queue.pending_count(), 1);

    gate.add_permits(1);
    eventually(|| queue.pending_count() == 0).await;
    assert_eq!(observed.completed.lock().len(), 1);
    assert_eq!(queue.processed_count(), 1);
}

#[tokio::test]
async fn test_cancel_returns_cancelled() {
    let gate = Arc::new(Semaphore::new(0));
    let pipeline = StubPipeline {
        gate: Some(gate.clone()),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let handle = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    let job_id = handle.job_id();
    let result = handle.wait_or_cancel(async {}).await;

    match result {
        Err(AppError::Cancelled(id)) => assert_eq!(id, job_id),
        other => panic!("expected Cancelled, got {:?}", other.map(|r| r.finish_reason())),
    }

    gate.add_permits(1);
    eventually(|| queue.pending_count() == 0).await;
}

#[tokio::test]
async fn test_abandoned_job_is_skipped_before_start() {
    let gate = Arc::new(Semaphore::new(0));
    let observed = Arc::new(Observed::default());
    let pipeline = StubPipeline {
        observed: observed.clone(),
        gate: Some(gate.clone()),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let running = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    let abandoned = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    let abandoned_id = abandoned.job_id();
    drop(abandoned);

    gate.add_permits(2);
    let record = running.wait().await.unwrap();
    assert_eq!(record.finish_reason(), FinishReason::Success);

    eventually(|| queue.processed_count() == 2).await;
    assert_eq!(queue.pending_count(), 0);
    let completed = observed.completed.lock();
    assert_eq!(completed.len(), 1);
    assert!(!completed.contains(&abandoned_id));
}

#[tokio::test]
async fn test_stats_report_running_job() {
    let gate = Arc::new(Semaphore::new(0));
    let pipeline = StubPipeline {
        gate: Some(gate.clone()),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let handle = queue.enqueue(job(1, SeedPolicy::Random)).unwrap();
    let job_id = handle.job_id();
    eventually(|| queue.stats().running == Some(job_id)).await;

    let stats = queue.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.capacity, 4);

    gate.add_permits(1);
    handle.wait().await.unwrap();
    assert_eq!(queue.stats().running, None);
}

#[tokio::test]
async fn test_dropping_handle_stops_running_job_at_checkpoint() {
    let observed = Arc::new(Observed::default());
    let pipeline = StubPipeline {
        observed: observed.clone(),
        delay: Duration::from_millis(50),
        ..StubPipeline::default()
    };
    let queue = TaskQueue::start(Box::new(pipeline), config(4));

    let handle = queue.enqueue(job(3, SeedPolicy::Random)).unwrap();
    let job_id = handle.job_id();
    eventually(|| queue.stats().running == Some(job_id)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(handle);

    eventually(|| queue.pending_count() == 0).await;
    {
        let outcomes = observed.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        let (emitted, interrupted) = outcomes[0];
        assert!(interrupted);
        assert!(emitted < 3);
    }

    let next = queue
        .enqueue(job(1, SeedPolicy::Random))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(next.finish_reason(), FinishReason::Success);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.processed_count(), 2);
}

#[tokio::test]
async fn test_fixed_seed_jobs_render_identically() {
    let queue = TaskQueue::start(
        Box::new(ProceduralPipeline::new(&PipelineConfig::default())),
        config(4),
    );
    let fixed_job = || {
        let params = GenerationParams {
            prompt: "a quiet harbour at dawn".to_string(),
            image_number: 2,
            seed: SeedPolicy::Fixed(777),
            aspect_ratio: AspectRatio {
                width: 1024,
                height: 1024,
            },
            ..GenerationParams::default()
        };
        JobDescriptor::new(JobKind::TextToImage, params, false).unwrap()
    };

    let first = queue.enqueue(fixed_job()).unwrap().wait().await.unwrap();
    let second = queue.enqueue(fixed_job()).unwrap().wait().await.unwrap();

    assert_eq!(first.finish_reason(), FinishReason::Success);
    assert_eq!(second.finish_reason(), FinishReason::Success);
    assert_eq!(first.images().len(), 2);
    assert_eq!(second.images().len(), 2);
    for (a, b) in first.images().iter().zip(second.images()) {
        assert_eq!(a.seed, b.seed);
        assert_eq!(a.image.as_raw(), b.image.as_raw());
    }
    assert_eq!(first.images()[0].seed, 777);
    assert_eq!(first.images()[1].seed, 778);
    assert_ne!(first.images()[0].image.as_raw(), first.images()[1].image.as_raw());
}
