//! Comparator: exactly one face per image, then distance-based similarity.

use crate::decode::ImagePayload;
use crate::extractor::EmbeddingExtractor;
use crate::pixels::PixelArray;
use crate::types::{Embedding, ImageSlot, SimilarityIndex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("No face detected in the {0}.")]
    NoFaceDetected(ImageSlot),
    #[error("Multiple faces detected in the {0}.")]
    MultipleFacesDetected(ImageSlot),
    #[error("An error occurred during face comparison: {0}")]
    Failure(String),
}

/// Extract the single embedding of `pixels`, or fail for zero / several faces.
fn single_embedding<E>(
    extractor: &mut E,
    pixels: &PixelArray,
    slot: ImageSlot,
) -> Result<Embedding, CompareError>
where
    E: EmbeddingExtractor + ?Sized,
{
    let mut embeddings = guarded_extract(extractor, pixels)?;
    tracing::debug!(%slot, faces = embeddings.len(), "embeddings extracted");

    match embeddings.len() {
        0 => Err(CompareError::NoFaceDetected(slot)),
        1 => Ok(embeddings.remove(0)),
        _ => Err(CompareError::MultipleFacesDetected(slot)),
    }
}

/// Run the extractor, converting both its errors and its panics into `Failure`.
fn guarded_extract<E>(extractor: &mut E, pixels: &PixelArray) -> Result<Vec<Embedding>, CompareError>
where
    E: EmbeddingExtractor + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(pixels))) {
        Ok(result) => result.map_err(|e| CompareError::Failure(e.to_string())),
        Err(payload) => {
            let msg = panic_message(payload.as_ref()).unwrap_or_else(|| "extractor panicked".into());
            tracing::error!(error = %msg, "extractor panicked");
            Err(CompareError::Failure(msg))
        }
    }
}

/// Text of a `panic!` payload, when it carries one.
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}

/// Compare two already-extracted embeddings.
pub fn similarity(a: &Embedding, b: &Embedding) -> Result<SimilarityIndex, CompareError> {
    let distance = a.euclidean_distance(b).ok_or_else(|| {
        CompareError::Failure(format!(
            "embedding dimensions differ: {} vs {}",
            a.dim(),
            b.dim()
        ))
    })?;
    Ok(SimilarityIndex::from_distance(distance))
}

/// Compare the faces in two decoded images.
///
/// Image A is fully checked before image B is extracted.
pub fn compare<E>(
    extractor: &mut E,
    a: &ImagePayload,
    b: &ImagePayload,
) -> Result<SimilarityIndex, CompareError>
where
    E: EmbeddingExtractor + ?Sized,
{
    let emb_a = single_embedding(extractor, &PixelArray::from_image(a.image()), ImageSlot::First)?;
    let emb_b = single_embedding(extractor, &PixelArray::from_image(b.image()), ImageSlot::Second)?;

    let index = similarity(&emb_a, &emb_b)?;
    tracing::info!(similarity = index.value(), "faces compared");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::extractor::ExtractError;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    /// Fake extractor keyed on the top-left pixel: 0 = no face, 255 = two
    /// faces, 254 = error, 253 = panic, 252 = wrong dimension, anything else
    /// = one face whose embedding is derived from the pixel value.
    struct KeyedExtractor;

    impl EmbeddingExtractor for KeyedExtractor {
        fn extract(&mut self, pixels: &PixelArray) -> Result<Vec<Embedding>, ExtractError> {
            let key = pixels.data[0];
            match key {
                0 => Ok(vec![]),
                255 => Ok(vec![Embedding::new(vec![0.0; 3]); 2]),
                254 => Err(ExtractError::Other("session crashed".into())),
                253 => panic!("unexpected array shape"),
                252 => Ok(vec![Embedding::new(vec![0.0; 7])]),
                v => Ok(vec![Embedding::new(vec![v as f32 / 100.0, 0.0, 0.0])]),
            }
        }
    }

    fn payload(key: u8) -> ImagePayload {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([key])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        decode(&STANDARD.encode(buf.into_inner()), ImageSlot::First).unwrap()
    }

    #[test]
    fn test_identical_images_max_similarity() {
        let a = payload(40);
        let index = compare(&mut KeyedExtractor, &a, &a).unwrap();
        assert_eq!(index.value(), 1.0);
    }

    #[test]
    fn test_similarity_value() {
        // Embeddings 0.40 and 0.70 on one axis: distance 0.3
        let index = compare(&mut KeyedExtractor, &payload(40), &payload(70)).unwrap();
        assert!((index.value() - 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_compare_symmetric() {
        let (a, b) = (payload(12), payload(90));
        let ab = compare(&mut KeyedExtractor, &a, &b).unwrap();
        let ba = compare(&mut KeyedExtractor, &b, &a).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_distant_faces_floor_at_zero() {
        let index = compare(&mut KeyedExtractor, &payload(1), &payload(200)).unwrap();
        assert_eq!(index.value(), 0.0);
    }

    #[test]
    fn test_no_face_first_image() {
        let err = compare(&mut KeyedExtractor, &payload(0), &payload(50)).unwrap_err();
        assert!(matches!(err, CompareError::NoFaceDetected(ImageSlot::First)));
        assert_eq!(err.to_string(), "No face detected in the first image.");
    }

    #[test]
    fn test_no_face_second_image() {
        let err = compare(&mut KeyedExtractor, &payload(50), &payload(0)).unwrap_err();
        assert_eq!(err.to_string(), "No face detected in the second image.");
    }

    #[test]
    fn test_multiple_faces() {
        let err = compare(&mut KeyedExtractor, &payload(255), &payload(50)).unwrap_err();
        assert_eq!(err.to_string(), "Multiple faces detected in the first image.");
        let err = compare(&mut KeyedExtractor, &payload(50), &payload(255)).unwrap_err();
        assert_eq!(err.to_string(), "Multiple faces detected in the second image.");
    }

    #[test]
    fn test_first_image_checked_before_second() {
        let err = compare(&mut KeyedExtractor, &payload(255), &payload(0)).unwrap_err();
        assert!(matches!(err, CompareError::MultipleFacesDetected(ImageSlot::First)));
    }

    #[test]
    fn test_extractor_error_is_failure() {
        let err = compare(&mut KeyedExtractor, &payload(254), &payload(50)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "An error occurred during face comparison: session crashed"
        );
    }

    #[test]
    fn test_extractor_panic_is_failure() {
        let err = compare(&mut KeyedExtractor, &payload(50), &payload(253)).unwrap_err();
        match err {
            CompareError::Failure(msg) => assert_eq!(msg, "unexpected array shape"),
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_is_failure() {
        let err = compare(&mut KeyedExtractor, &payload(50), &payload(252)).unwrap_err();
        assert!(matches!(err, CompareError::Failure(_)));
    }

    #[test]
    fn test_works_through_trait_object() {
        let mut boxed: Box<dyn EmbeddingExtractor> = Box::new(KeyedExtractor);
        let a = payload(33);
        assert!(compare(boxed.as_mut(), &a, &a).is_ok());
    }

    #[test]
    fn test_panic_message_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("bad shape");
        let formatted: Box<dyn Any + Send> = Box::new(format!("bad shape {}", 3));
        let opaque: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(literal.as_ref()).as_deref(), Some("bad shape"));
        assert_eq!(panic_message(formatted.as_ref()).as_deref(), Some("bad shape 3"));
        assert_eq!(panic_message(opaque.as_ref()), None);
    }
}
