//! Result records produced by the execution worker

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::queue::job::JobId;

/// How the execution of a job (or of one of its images) ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishReason {
    #[serde(rename = "SUCCESS")]
    Success,
    /// Early stop because the caller went away
    #[serde(rename = "USER_CANCEL")]
    UserCancel,
    /// Early stop because the pipeline failed mid-generation
    #[serde(rename = "ERROR")]
    ProcessingError,
    /// The job was never accepted. Admission rejects with `AppError::QueueFull`
    /// instead, so the worker never emits this.
    #[serde(rename = "QUEUE_IS_FULL")]
    QueueFull,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Success => "SUCCESS",
            FinishReason::UserCancel => "USER_CANCEL",
            FinishReason::ProcessingError => "ERROR",
            FinishReason::QueueFull => "QUEUE_IS_FULL",
        }
    }

    pub fn is_success(self) -> bool {
        self == FinishReason::Success
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raster produced by the pipeline
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: RgbImage,
    /// Concrete seed used for this image, never the random sentinel
    pub seed: u64,
    pub finish_reason: FinishReason,
}

/// Immutable outcome of executing one job
#[derive(Debug, Clone)]
pub struct ResultRecord {
    job_id: JobId,
    images: Vec<GeneratedImage>,
    finish_reason: FinishReason,
    detail: Option<String>,
    elapsed: Duration,
}

impl ResultRecord {
    pub fn new(
        job_id: JobId,
        images: Vec<GeneratedImage>,
        finish_reason: FinishReason,
        detail: Option<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            job_id,
            images,
            finish_reason,
            detail,
            elapsed,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn images(&self) -> &[GeneratedImage] {
        &self.images
    }

    pub fn into_images(self) -> Vec<GeneratedImage> {
        self.images
    }

    /// Overall outcome of the run; images completed before an early stop
    /// keep their own `Success` tag.
    pub fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }

    /// Failure message when the run stopped early because of an error
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
