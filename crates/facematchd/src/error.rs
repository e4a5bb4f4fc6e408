//! Request-boundary error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facematch_core::{CompareError, DecodeError, ImageSlot};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to parse JSON payload: {0}")]
    PayloadParse(String),
    #[error("{}", missing_image_message(.0))]
    MissingImage(ImageSlot),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Compare(#[from] CompareError),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// Image 1 is the enrolled photo, image 2 the live capture.
fn missing_image_message(slot: &ImageSlot) -> &'static str {
    match *slot {
        ImageSlot::First => "No image from DB.",
        ImageSlot::Second => "No image from User.",
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PayloadParse(_)
            | ApiError::MissingImage(_)
            | ApiError::Decode(DecodeError::Base64 { .. })
            | ApiError::Decode(DecodeError::NotText { .. })
            | ApiError::Decode(DecodeError::ImageLoad { .. })
            | ApiError::Compare(CompareError::NoFaceDetected(_))
            | ApiError::Compare(CompareError::MultipleFacesDetected(_)) => StatusCode::BAD_REQUEST,
            ApiError::Compare(CompareError::Failure(_)) | ApiError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::PayloadParse(_) => "payload_parse",
            ApiError::MissingImage(_) => "missing_image",
            ApiError::Decode(DecodeError::Base64 { .. })
            | ApiError::Decode(DecodeError::NotText { .. }) => "base64_decode",
            ApiError::Decode(DecodeError::ImageLoad { .. }) => "image_load",
            ApiError::Compare(CompareError::NoFaceDetected(_)) => "no_face_detected",
            ApiError::Compare(CompareError::MultipleFacesDetected(_)) => "multiple_faces_detected",
            ApiError::Compare(CompareError::Failure(_)) => "comparison_failure",
            ApiError::Unexpected(_) => "unexpected",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::info!(kind = self.kind(), error = %self, "request rejected");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
