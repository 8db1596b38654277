use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scribble_core::SketchError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Sketch(#[from] SketchError),
    #[error("invalid form data: {0}")]
    Multipart(#[from] MultipartError),
    #[error("invalid value for {field}: {value:?}")]
    Field { field: String, value: String },
    #[error("failed to encode generated image: {0}")]
    Encode(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Sketch(SketchError::Validation(_)) | ApiError::Field { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Multipart(err) => err.status(),
            ApiError::Sketch(SketchError::Preprocess(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Sketch(SketchError::Load { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Sketch(SketchError::Generation(_)) | ApiError::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
            format!("Generation failed: {self}")
        } else {
            tracing::warn!(%status, error = %self, "request rejected");
            self.to_string()
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
