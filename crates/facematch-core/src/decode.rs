//! Base64 payload decoding and raster image loading.

use crate::types::ImageSlot;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, GenericImageView};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to decode base64 images: {source} ({slot})")]
    Base64 {
        slot: ImageSlot,
        #[source]
        source: base64::DecodeError,
    },
    /// The request carried something other than text where base64 was expected.
    #[error("Failed to decode base64 images: expected a base64 string, got {found} ({slot})")]
    NotText { slot: ImageSlot, found: &'static str },
    #[error("Failed to load images: {source} ({slot})")]
    ImageLoad {
        slot: ImageSlot,
        #[source]
        source: image::ImageError,
    },
}

/// A decoded, loadable raster image.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    image: DynamicImage,
    encoded_len: usize,
}

impl ImagePayload {
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Size of the encoded image file in bytes.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }
}

/// Strip an optional `data:<mime>;base64,` prefix and surrounding whitespace.
fn strip_data_url(input: &str) -> &str {
    let trimmed = input.trim();
    match trimmed.strip_prefix("data:") {
        Some(rest) => match rest.find(";base64,") {
            Some(idx) => &rest[idx + ";base64,".len()..],
            None => trimmed,
        },
        None => trimmed,
    }
}

/// Decode a standard-alphabet, padded base64 string.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(strip_data_url(input))
}

/// Load encoded image bytes, guessing the format from magic bytes.
pub fn load_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

fn decode_slot(input: &str, slot: ImageSlot) -> Result<Vec<u8>, DecodeError> {
    decode_base64(input).map_err(|source| DecodeError::Base64 { slot, source })
}

fn load_slot(bytes: Vec<u8>, slot: ImageSlot) -> Result<ImagePayload, DecodeError> {
    let image = load_image(&bytes).map_err(|source| DecodeError::ImageLoad { slot, source })?;
    Ok(ImagePayload {
        image,
        encoded_len: bytes.len(),
    })
}

/// Decode one base64 image end to end.
pub fn decode(input: &str, slot: ImageSlot) -> Result<ImagePayload, DecodeError> {
    load_slot(decode_slot(input, slot)?, slot)
}

/// Decode both request images.
///
/// Both base64 strings are decoded before either image is loaded, so a base64
/// error in the second image is reported ahead of a load error in the first.
pub fn decode_pair(first: &str, second: &str) -> Result<(ImagePayload, ImagePayload), DecodeError> {
    let bytes_a = decode_slot(first, ImageSlot::First)?;
    let bytes_b = decode_slot(second, ImageSlot::Second)?;

    let a = load_slot(bytes_a, ImageSlot::First)?;
    let b = load_slot(bytes_b, ImageSlot::Second)?;

    tracing::debug!(
        first_bytes = a.encoded_len(),
        first_dims = ?a.image.dimensions(),
        second_bytes = b.encoded_len(),
        second_dims = ?b.image.dimensions(),
        "decoded image pair"
    );

    Ok((a, b))
}
