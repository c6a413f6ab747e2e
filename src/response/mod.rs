//! Response projection: JSON array of base64 images, or one raw PNG

pub mod base64;
pub mod codec;

use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::queue::result::{FinishReason, ResultRecord};

pub const PNG_MEDIA_TYPE: &str = "image/png";

/// Decide between streamed PNG and JSON output.
///
/// A non-empty `accept` query parameter takes precedence over the `Accept`
/// header; the response is streamed only when the winning value is
/// `image/png`.
pub fn streaming_output(accept_header: Option<&str>, accept_query: Option<&str>) -> bool {
    let accept = match accept_query {
        Some(query) if !query.trim().is_empty() => Some(query),
        _ => accept_header,
    };

    accept
        .map(|value| value.trim().eq_ignore_ascii_case(PNG_MEDIA_TYPE))
        .unwrap_or(false)
}

/// One entry of the JSON response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImageBase64 {
    pub base64: Option<String>,
    pub seed: i64,
    pub finish_reason: FinishReason,
}

/// Build the JSON entries for a record.
///
/// Every image gets its own entry. When the run stopped early a trailing
/// entry without image data carries the overall finish reason, so a run that
/// produced nothing still reports why.
pub fn to_entries(record: &ResultRecord) -> Result<Vec<GeneratedImageBase64>> {
    let mut entries = record
        .images()
        .iter()
        .map(|generated| {
            Ok(GeneratedImageBase64 {
                base64: Some(base64::encode_png(&generated.image)?),
                seed: generated.seed as i64,
                finish_reason: generated.finish_reason,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if !record.finish_reason().is_success() {
        entries.push(GeneratedImageBase64 {
            base64: None,
            seed: -1,
            finish_reason: record.finish_reason(),
        });
    }

    Ok(entries)
}

/// Convert a result record into an HTTP response
pub fn project(record: ResultRecord, streaming_output: bool) -> Result<Response> {
    if !streaming_output {
        return Ok(Json(to_entries(&record)?).into_response());
    }

    let finish_reason = record.finish_reason();
    match record.into_images().into_iter().next() {
        Some(generated) => {
            let bytes = codec::encode_png(&generated.image)?;
            Ok(([(CONTENT_TYPE, PNG_MEDIA_TYPE)], bytes).into_response())
        }
        None => Err(AppError::GenerationFailed(finish_reason)),
    }
}
