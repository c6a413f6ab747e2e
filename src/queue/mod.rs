//! Request admission and execution queue

pub mod job;
pub mod result;
pub mod task_queue;
pub(crate) mod worker;

pub use job::{JobDescriptor, JobId, JobKind};
pub use result::{FinishReason, GeneratedImage, ResultRecord};
pub use task_queue::{JobHandle, QueueConfig, QueueStats, TaskQueue};
