use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;

use crate::errors::{AppError, AppResult};

/// Anything shorter cannot hold a usable photo.
pub const MIN_IMAGE_PAYLOAD_LEN: usize = 100;

pub fn validate_image_payload(payload: &str) -> AppResult<()> {
    if payload.trim().len() < MIN_IMAGE_PAYLOAD_LEN {
        return Err(AppError::InvalidImage(format!(
            "payload shorter than {MIN_IMAGE_PAYLOAD_LEN} characters"
        )));
    }
    Ok(())
}

/// Accepts raw base64 or a `data:<mime>;base64,<...>` URL.
pub fn decode_image_payload(payload: &str) -> AppResult<Vec<u8>> {
    let trimmed = payload.trim();
    let encoded = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| AppError::InvalidImage("malformed data URL".into()))?,
        None => trimmed,
    };

    general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| AppError::InvalidImage(format!("base64 decode failed: {err}")))
}

pub fn decode_image(bytes: &[u8]) -> AppResult<RgbImage> {
    if bytes.is_empty() {
        return Err(AppError::InvalidImage("empty image".into()));
    }
    image::load_from_memory(bytes)
        .map(|image| image.to_rgb8())
        .map_err(|err| AppError::InvalidImage(err.to_string()))
}
