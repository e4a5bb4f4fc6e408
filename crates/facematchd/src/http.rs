//! HTTP boundary: routing, request parsing and response shaping.

use crate::engine::{EngineError, EngineHandle};
use crate::error::{ApiError, ErrorBody};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facematch_core::{decode_pair, panic_message, DecodeError, ImageSlot, SimilarityIndex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
}

impl AppState {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

/// Body of `POST /api/authenticate`. Image 1 is the enrolled photo, image 2
/// the live capture; both should be base64 strings.
///
/// Fields stay untyped until the per-slot checks in [`parse_request`] have run.
#[derive(Debug, Default, Deserialize)]
pub struct AuthenticateRequest {
    #[serde(default)]
    pub image1: Option<serde_json::Value>,
    #[serde(default)]
    pub image2: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct AuthenticateResponse {
    pub similarity_index: SimilarityIndex,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Compare(e) => ApiError::Compare(e),
            EngineError::ChannelClosed => ApiError::Unexpected(err.to_string()),
        }
    }
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/authenticate", post(authenticate_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
        .with_state(state)
}

/// Parse the raw body into the two base64 strings.
///
/// Anything that is not a JSON object is a parse error. Image 1 is checked
/// before image 2: a slot that is absent or holds an empty value (`null`, `""`,
/// `0`, `false`, `[]`, `{}`) is missing. Only after both slots are present is a
/// non-string value rejected, as a base64 decode error for that slot.
fn parse_request(body: &[u8]) -> Result<(String, String), ApiError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ApiError::PayloadParse(e.to_string()))?;

    if !value.is_object() {
        return Err(ApiError::PayloadParse(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }

    let request: AuthenticateRequest =
        serde_json::from_value(value).map_err(|e| ApiError::PayloadParse(e.to_string()))?;

    let image1 = present(request.image1).ok_or(ApiError::MissingImage(ImageSlot::First))?;
    let image2 = present(request.image2).ok_or(ApiError::MissingImage(ImageSlot::Second))?;

    Ok((
        into_text(image1, ImageSlot::First)?,
        into_text(image2, ImageSlot::Second)?,
    ))
}

/// `None` for an absent or empty-valued field.
fn present(field: Option<serde_json::Value>) -> Option<serde_json::Value> {
    field.filter(|v| !is_empty_value(v))
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn into_text(value: serde_json::Value, slot: ImageSlot) -> Result<String, ApiError> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        other => Err(DecodeError::NotText {
            slot,
            found: json_kind(&other),
        }
        .into()),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// POST /api/authenticate - similarity index of the faces in two images.
async fn authenticate_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<AuthenticateResponse>, ApiError> {
    let body = body.map_err(|e| ApiError::PayloadParse(e.body_text()))?;
    let (image1, image2) = parse_request(&body)?;

    tracing::debug!(
        image1_len = image1.len(),
        image2_len = image2.len(),
        "authenticate request"
    );

    // Decoding stays off the engine thread; only loadable images are queued.
    let (a, b) = tokio::task::spawn_blocking(move || decode_pair(&image1, &image2))
        .await
        .map_err(|e| ApiError::Unexpected(format!("decode task failed: {e}")))??;

    let similarity_index = state.engine.compare(a, b).await?;
    tracing::info!(similarity = similarity_index.value(), "authenticate succeeded");

    Ok(Json(AuthenticateResponse { similarity_index }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic_message(payload.as_ref()).unwrap_or_else(|| "handler panicked".to_string());
    tracing::error!(error = %detail, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: ApiError::Unexpected(detail).to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use facematch_core::{Embedding, EmbeddingExtractor, ExtractError, PixelArray};
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;
    use tower::ServiceExt; // for `oneshot`

    /// Keyed on the first pixel: 0 = blank scene, 255 = two people,
    /// 254 = extractor failure, anything else = one face.
    struct KeyedExtractor;

    impl EmbeddingExtractor for KeyedExtractor {
        fn extract(&mut self, pixels: &PixelArray) -> Result<Vec<Embedding>, ExtractError> {
            match pixels.data[0] {
                0 => Ok(vec![]),
                255 => Ok(vec![
                    Embedding::new(vec![0.1, 0.2]),
                    Embedding::new(vec![0.3, 0.4]),
                ]),
                254 => Err(ExtractError::Other("inference session crashed".into())),
                v => Ok(vec![Embedding::new(vec![v as f32 / 100.0, 0.0])]),
            }
        }
    }

    fn app() -> Router {
        let engine = spawn_engine(KeyedExtractor, 4).unwrap();
        router(AppState::new(engine), 1024 * 1024)
    }

    /// Router whose engine thread is gone; anything reaching it is a 500.
    fn app_without_engine() -> Router {
        router(AppState::new(EngineHandle::detached()), 1024 * 1024)
    }

    fn image_b64(key: u8) -> String {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([key])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        STANDARD.encode(buf.into_inner())
    }

    async fn post_raw(body: impl Into<Body>) -> (StatusCode, serde_json::Value) {
        post_to(app(), body).await
    }

    async fn post_to(app: Router, body: impl Into<Body>) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/authenticate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body.into())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post(body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        post_raw(body.to_string()).await
    }

    fn error_of(body: &serde_json::Value) -> &str {
        body["error"].as_str().unwrap()
    }

    #[tokio::test]
    async fn test_same_image_twice_max_similarity() {
        let img = image_b64(70);
        let (status, body) = post(json!({"image1": img, "image2": img})).await;
        assert_eq!(status, StatusCode::OK);
        assert!((body["similarity_index"].as_f64().unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_similarity_in_unit_range_and_symmetric() {
        let (a, b) = (image_b64(40), image_b64(60));
        let (status, ab) = post(json!({"image1": a, "image2": b})).await;
        assert_eq!(status, StatusCode::OK);
        let (_, ba) = post(json!({"image1": b, "image2": a})).await;

        let ab = ab["similarity_index"].as_f64().unwrap();
        let ba = ba["similarity_index"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&ab));
        assert_eq!(ab, ba);
        assert!((ab - 0.8).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (status, body) = post_raw("{\"image1\": ").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to parse JSON payload: "));
    }

    #[tokio::test]
    async fn test_non_object_payload() {
        let (status, body) = post(json!(["a", "b"])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            error_of(&body),
            "Failed to parse JSON payload: expected a JSON object, got an array"
        );
    }

    #[tokio::test]
    async fn test_non_string_image_is_decode_error() {
        let (status, body) = post(json!({"image1": 42, "image2": "abc"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            error_of(&body),
            "Failed to decode base64 images: expected a base64 string, got a number (first image)"
        );
    }

    #[tokio::test]
    async fn test_non_string_second_image_is_decode_error() {
        let (status, body) = post(json!({"image1": image_b64(50), "image2": {"b64": "x"}})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to decode base64 images: "));
        assert!(error_of(&body).ends_with("(second image)"));
    }

    #[tokio::test]
    async fn test_missing_image1_wins_over_non_string_image2() {
        for payload in [
            json!({"image2": 42}),
            json!({"image1": null, "image2": 42}),
            json!({"image1": "", "image2": ["x"]}),
        ] {
            let (status, body) = post(payload.clone()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{payload}");
            assert_eq!(body, json!({"error": "No image from DB."}), "{payload}");
        }
    }

    #[tokio::test]
    async fn test_empty_values_count_as_missing() {
        for empty in [json!(0), json!(false), json!([]), json!({}), json!(0.0)] {
            let (_, body) = post(json!({"image1": empty, "image2": image_b64(50)})).await;
            assert_eq!(body, json!({"error": "No image from DB."}), "image1 = {empty}");

            let (_, body) = post(json!({"image1": image_b64(50), "image2": empty})).await;
            assert_eq!(body, json!({"error": "No image from User."}), "image2 = {empty}");
        }
    }

    #[tokio::test]
    async fn test_missing_image1() {
        let (status, body) = post(json!({"image2": image_b64(50)})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image from DB."}));
    }

    #[tokio::test]
    async fn test_empty_image1_with_valid_image2() {
        let (status, body) = post(json!({"image1": "", "image2": image_b64(50)})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image from DB."}));
    }

    #[tokio::test]
    async fn test_missing_image1_wins_over_invalid_image2() {
        let (status, body) = post(json!({"image1": null, "image2": "%%%"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image from DB."}));
    }

    #[tokio::test]
    async fn test_missing_image2() {
        let (status, body) = post(json!({"image1": "!!!not base64"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image from User."}));
    }

    #[tokio::test]
    async fn test_invalid_base64() {
        let (status, body) = post(json!({"image1": "***", "image2": image_b64(50)})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to decode base64 images: "));
    }

    #[tokio::test]
    async fn test_not_an_image() {
        let text = STANDARD.encode(b"definitely not a picture");
        let (status, body) = post(json!({"image1": image_b64(50), "image2": text})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to load images: "));
    }

    #[tokio::test]
    async fn test_decode_errors_do_not_need_the_engine() {
        let bad_base64 = json!({"image1": "***", "image2": image_b64(50)});
        let (status, body) = post_to(app_without_engine(), bad_base64.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to decode base64 images: "));

        let text = STANDARD.encode(b"definitely not a picture");
        let not_image = json!({"image1": text, "image2": image_b64(50)});
        let (status, body) = post_to(app_without_engine(), not_image.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to load images: "));

        let valid = json!({"image1": image_b64(50), "image2": image_b64(50)});
        let (status, body) = post_to(app_without_engine(), valid.to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_of(&body), "An unexpected error occurred: engine thread exited");
    }

    #[tokio::test]
    async fn test_blank_scene_first_image() {
        let (status, body) = post(json!({"image1": image_b64(0), "image2": image_b64(50)})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No face detected in the first image."}));
    }

    #[tokio::test]
    async fn test_blank_scene_second_image() {
        let (status, body) = post(json!({"image1": image_b64(50), "image2": image_b64(0)})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No face detected in the second image."}));
    }

    #[tokio::test]
    async fn test_two_people_first_image() {
        let (status, body) = post(json!({"image1": image_b64(255), "image2": image_b64(50)})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Multiple faces detected in the first image."}));
    }

    #[tokio::test]
    async fn test_extractor_failure_is_500() {
        let (status, body) = post(json!({"image1": image_b64(50), "image2": image_b64(254)})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            error_of(&body),
            "An error occurred during face comparison: inference session crashed"
        );
    }

    #[tokio::test]
    async fn test_oversized_body_is_json_400() {
        let big = "A".repeat(2 * 1024 * 1024);
        let (status, body) = post(json!({"image1": big, "image2": big})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(&body).starts_with("Failed to parse JSON payload: "));
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/authenticate")
                    .header(header::ORIGIN, "http://voting.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[test]
    fn test_parse_request_treats_null_as_missing() {
        let err = parse_request(br#"{"image1": "abc", "image2": null}"#).unwrap_err();
        assert!(matches!(err, ApiError::MissingImage(ImageSlot::Second)));
    }

    #[test]
    fn test_parse_request_rejects_non_string_after_presence_checks() {
        let err = parse_request(br#"{"image1": true, "image2": "abc"}"#).unwrap_err();
        assert!(matches!(
            err,
            ApiError::Decode(DecodeError::NotText { slot: ImageSlot::First, found: "a boolean" })
        ));

        let err = parse_request(br#"{"image1": "abc", "image2": null}"#).unwrap_err();
        assert!(matches!(err, ApiError::MissingImage(ImageSlot::Second)));
    }

    #[test]
    fn test_parse_request_ignores_unknown_fields() {
        let (a, b) = parse_request(br#"{"image1": "a", "image2": "b", "nid": "1"}"#).unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
    }
}
