//! Configuration module

pub mod settings;

pub use settings::{LoggingConfig, PipelineConfig, ServerConfig, Settings};
