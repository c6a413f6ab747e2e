//! Base64 encoding of generated images

use base64::{engine::general_purpose::STANDARD, Engine};
use image::RgbImage;

use crate::error::Result;
use crate::response::codec;

/// Encode binary data to base64 string
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Encode an image as PNG, then base64
pub fn encode_png(image: &RgbImage) -> Result<String> {
    Ok(encode(&codec::encode_png(image)?))
}
