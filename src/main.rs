//! Main entry point for the generation server

use clap::Parser;
use fooocus_gateway::{
    api,
    config::{LoggingConfig, Settings},
    pipeline::{GenerationPipeline, ProceduralPipeline},
    queue::task_queue::TaskQueue,
    AppState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fooocus-gateway", version, about = "Single-worker image generation server")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Load the pipeline before starting the HTTP server
    #[arg(long)]
    preload_pipeline: bool,
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Load configuration, command line wins over file and environment
    let mut settings = Settings::load_from_path(&args.config)?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }
    if args.preload_pipeline {
        settings.pipeline.preload = true;
    }
    settings.validate()?;

    init_logging(&settings.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting generation server");

    let mut pipeline = ProceduralPipeline::new(&settings.pipeline);
    if settings.pipeline.preload {
        info!("Preloading pipeline");
        pipeline.preload().await?;
    }

    let task_queue = Arc::new(TaskQueue::start(Box::new(pipeline), settings.queue.clone()));
    info!(
        max_pending = settings.queue.max_pending,
        timeout_ms = settings.queue.timeout_ms,
        "Task queue started"
    );

    let app_state = Arc::new(AppState { task_queue });
    let app = api::routes::create_router(app_state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}
