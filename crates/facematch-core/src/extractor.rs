//! Face embedding extraction seam.
//!
//! The comparator only sees [`EmbeddingExtractor`]: one embedding per face
//! found in a raster, or an empty list when there is none. [`OnnxExtractor`]
//! is the production implementation (SCRFD detection + ArcFace recognition).

use crate::detector::{DetectorError, FaceDetector};
use crate::pixels::PixelArray;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("{0}")]
    Other(String),
}

/// Produces face embeddings from an RGB raster.
pub trait EmbeddingExtractor: Send {
    /// Return one embedding per detected face; empty when no face is found.
    fn extract(&mut self, pixels: &PixelArray) -> Result<Vec<Embedding>, ExtractError>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, pixels: &PixelArray) -> Result<Vec<Embedding>, ExtractError> {
        (**self).extract(pixels)
    }
}

/// Default model directory: `$XDG_DATA_HOME/facematch/models`, falling back
/// to `~/.local/share/facematch/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
        .join("models")
}

/// SCRFD + ArcFace extractor backed by ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails fast if either file is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let scrfd_path = model_dir.join(SCRFD_MODEL_FILE);
        let arcface_path = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd_path.to_string_lossy())?;
        tracing::info!(path = %scrfd_path.display(), "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(&arcface_path.to_string_lossy())?;
        tracing::info!(path = %arcface_path.display(), "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, pixels: &PixelArray) -> Result<Vec<Embedding>, ExtractError> {
        if pixels.is_empty() {
            return Err(ExtractError::EmptyImage);
        }

        let faces = self.detector.detect_pixels(pixels)?;
        tracing::debug!(
            faces = faces.len(),
            width = pixels.width,
            height = pixels.height,
            brightness = pixels.avg_brightness(),
            "faces detected"
        );

        faces
            .iter()
            .map(|face| {
                self.recognizer
                    .extract(pixels, face)
                    .map_err(ExtractError::from)
            })
            .collect()
    }
}
