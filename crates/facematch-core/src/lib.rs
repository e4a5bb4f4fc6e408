//! facematch-core: face image decoding, embedding extraction and comparison.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime for CPU inference. The comparator only depends on
//! the [`EmbeddingExtractor`] trait so it can be driven by any backend.

mod alignment;
pub mod compare;
pub mod decode;
pub mod detector;
pub mod extractor;
pub mod pixels;
pub mod recognizer;
pub mod types;

pub use compare::{compare, panic_message, CompareError};
pub use decode::{decode_pair, DecodeError, ImagePayload};
pub use detector::FaceDetector;
pub use extractor::{default_model_dir, EmbeddingExtractor, ExtractError, OnnxExtractor};
pub use pixels::PixelArray;
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, ImageSlot, SimilarityIndex};

use thiserror::Error;

/// Failure of the decode-then-compare pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Compare(#[from] CompareError),
}

/// Decode two base64 images and compare their faces.
pub fn compare_encoded<E>(
    extractor: &mut E,
    image1: &str,
    image2: &str,
) -> Result<SimilarityIndex, Error>
where
    E: EmbeddingExtractor + ?Sized,
{
    let (a, b) = decode_pair(image1, image2)?;
    Ok(compare(extractor, &a, &b)?)
}
