//! Request handlers for the generation endpoints

use axum::{
    extract::{Multipart, Query, State},
    http::{header::ACCEPT, HeaderMap},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::requests::{FormFields, ImgInpaintOrOutpaintRequest, ImgUpscaleOrVaryRequest, Text2ImgRequest};
use crate::error::{AppError, Result};
use crate::queue::{JobDescriptor, QueueStats};
use crate::response;
use crate::AppState;

/// `?accept=` override for the `Accept` header
#[derive(Debug, Default, Deserialize)]
pub struct AcceptQuery {
    pub accept: Option<String>,
}

fn streaming_output(headers: &HeaderMap, query: &AcceptQuery) -> bool {
    let header = headers.get(ACCEPT).and_then(|value| value.to_str().ok());
    response::streaming_output(header, query.accept.as_deref())
}

pub async fn text_to_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AcceptQuery>,
    Json(request): Json<Text2ImgRequest>,
) -> Result<Response> {
    let job = request.into_job(streaming_output(&headers, &query))?;
    run_job(&state, job).await
}

pub async fn image_upscale_vary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AcceptQuery>,
    multipart: Multipart,
) -> Result<Response> {
    let form = FormFields::read(multipart).await?;
    let job = ImgUpscaleOrVaryRequest::from_form(&form)?.into_job(streaming_output(&headers, &query))?;
    run_job(&state, job).await
}

pub async fn image_inpaint_outpaint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AcceptQuery>,
    multipart: Multipart,
) -> Result<Response> {
    let form = FormFields::read(multipart).await?;
    let job =
        ImgInpaintOrOutpaintRequest::from_form(&form)?.into_job(streaming_output(&headers, &query))?;
    run_job(&state, job).await
}

/// Queue the job and wait for its result. If the client disconnects this
/// future is dropped along with the job handle, which the worker observes.
async fn run_job(state: &AppState, job: JobDescriptor) -> Result<Response> {
    let streaming = job.streaming();
    let handle = state.task_queue.enqueue(job)?;
    let record = handle.wait().await?;

    tokio::task::spawn_blocking(move || response::project(record, streaming))
        .await
        .map_err(|e| AppError::Internal(format!("Response encoding task failed: {}", e)))?
}

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<QueueStats> {
    Json(state.task_queue.stats())
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.task_queue.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pending": stats.pending,
    }))
}
