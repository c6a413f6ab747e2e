//! Generation pipeline abstraction
//!
//! The pipeline is the single expensive, non-shareable resource of the
//! process. Implementations are handed to [`TaskQueue::start`] by value and
//! from then on only the execution worker can reach them.
//!
//! [`TaskQueue::start`]: crate::queue::task_queue::TaskQueue::start

pub mod procedural;

use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;
use tracing::warn;

use crate::queue::job::{JobDescriptor, MAX_SEED};
use crate::queue::result::{FinishReason, GeneratedImage};

pub use procedural::ProceduralPipeline;

/// Failures reported by a pipeline run. These never reach the caller
/// directly; the worker folds them into the result record.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("generation interrupted at a step checkpoint")]
    Interrupted,

    #[error("model error: {0}")]
    Model(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pipeline produced more than the {requested} requested images")]
    Overflow { requested: usize },
}

/// Trait for the compute pipeline driven by the execution worker
#[async_trait]
pub trait GenerationPipeline: Send + Sync {
    /// Pipeline name for logging
    fn name(&self) -> &str;

    /// Load weights ahead of the first job
    async fn preload(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Generate `ctx.requested()` images for `job`.
    ///
    /// Images must be handed to [`GenerationContext::emit`] as soon as they
    /// are finished so they survive a later failure. Implementations should
    /// call [`GenerationContext::checkpoint`] between steps.
    async fn generate(
        &mut self,
        job: &JobDescriptor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<(), PipelineError>;
}

/// Per-run state shared between the worker and the pipeline
pub struct GenerationContext<'a> {
    base_seed: u64,
    requested: usize,
    images: Vec<GeneratedImage>,
    cancel_probe: &'a (dyn Fn() -> bool + Send + Sync),
}

impl<'a> GenerationContext<'a> {
    pub fn new(
        requested: u32,
        base_seed: u64,
        cancel_probe: &'a (dyn Fn() -> bool + Send + Sync),
    ) -> Self {
        Self {
            base_seed,
            requested: requested as usize,
            images: Vec::with_capacity(requested as usize),
            cancel_probe,
        }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Seed of the `index`-th image of the run
    pub fn seed_for(&self, index: usize) -> u64 {
        self.base_seed.wrapping_add(index as u64) & MAX_SEED
    }

    pub fn completed(&self) -> usize {
        self.images.len()
    }

    pub fn is_cancelled(&self) -> bool {
        (self.cancel_probe)()
    }

    /// Cooperative cancellation point
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Record the next finished image, tagging it with its seed
    pub fn emit(&mut self, image: RgbImage) -> Result<(), PipelineError> {
        if self.images.len() >= self.requested {
            warn!(requested = self.requested, "Pipeline emitted an extra image");
            return Err(PipelineError::Overflow {
                requested: self.requested,
            });
        }

        let seed = self.seed_for(self.images.len());
        self.images.push(GeneratedImage {
            image,
            seed,
            finish_reason: FinishReason::Success,
        });
        Ok(())
    }

    pub(crate) fn into_images(self) -> Vec<GeneratedImage> {
        self.images
    }
}
