//! PNG encoding of results and decoding of uploaded images

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::io::Cursor;

use crate::error::{AppError, Result};

pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Largest accepted width or height of an uploaded image
pub const MAX_INPUT_SIDE: u32 = 2048;

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

fn decode(field: &str, data: &[u8]) -> Result<DynamicImage> {
    if data.is_empty() {
        return Err(AppError::InvalidRequest(format!("{} is empty", field)));
    }

    let image = image::load_from_memory(data)
        .map_err(|e| AppError::InvalidRequest(format!("{} is not a readable image: {}", field, e)))?;

    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 || width > MAX_INPUT_SIDE || height > MAX_INPUT_SIDE {
        return Err(AppError::InvalidRequest(format!(
            "{} is {}x{}; each side must be between 1 and {}",
            field, width, height, MAX_INPUT_SIDE
        )));
    }

    Ok(image)
}

/// Decode an uploaded source image to RGB
pub fn decode_rgb(field: &str, data: &[u8]) -> Result<RgbImage> {
    Ok(decode(field, data)?.to_rgb8())
}

/// Decode an uploaded mask to single-channel luma
pub fn decode_mask(field: &str, data: &[u8]) -> Result<GrayImage> {
    Ok(decode(field, data)?.to_luma8())
}
