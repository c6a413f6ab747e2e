//! Router construction

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers;
use crate::AppState;

/// Upper bound for request bodies, uploads included
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/generation/queue", get(handlers::queue_stats))
        .route("/v1/generation/text-to-image", post(handlers::text_to_image))
        .route(
            "/v1/generation/image-upscale-vary",
            post(handlers::image_upscale_vary),
        )
        .route(
            "/v1/generation/image-inpait-outpaint",
            post(handlers::image_inpaint_outpaint),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
