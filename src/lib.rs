//! Fooocus-compatible image generation server
//!
//! Generation requests from any number of HTTP callers are admitted into a
//! FIFO queue and executed one at a time by a single worker that owns the
//! compute pipeline.

pub mod api;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod response;

pub use error::{AppError, Result};

use std::sync::Arc;

use queue::task_queue::TaskQueue;

/// Application state shared across all handlers
pub struct AppState {
    pub task_queue: Arc<TaskQueue>,
}
