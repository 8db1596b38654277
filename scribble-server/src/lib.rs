mod error;

use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use scribble_core::{accelerator_probe, SketchService, SketchUpload};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Encodes an image as PNG and wraps it in standard base64.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState(Arc<SketchService>);

impl AppState {
    pub fn new(service: Arc<SketchService>) -> Self {
        Self(service)
    }

    pub fn service(&self) -> &Arc<SketchService> {
        &self.0
    }
}

#[derive(Serialize)]
pub struct GenerationResponse {
    pub success: bool,
    pub image: String,
    pub prompt: String,
    pub generation_time: f64,
    pub image_size: [u32; 2],
    pub message: &'static str,
}

#[derive(Serialize)]
pub struct ModelStatus {
    pub models_loaded: bool,
    pub status: &'static str,
}

pub fn build_router(state: AppState, options: &RouterOptions) -> Result<Router> {
    let origins = options
        .allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    Ok(Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/models/status", get(model_status))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn root() -> Json<Value> {
    Json(json!({
        "status": "running",
        "message": "Sketch-to-Image API is operational",
        "endpoints": {
            "health": "/health",
            "generate": "/generate (POST)",
            "models_status": "/models/status",
        }
    }))
}

async fn health() -> Json<Value> {
    let accelerator = accelerator_probe();
    Json(json!({
        "status": "healthy",
        "gpu_available": accelerator.is_accelerator(),
        "gpu_type": accelerator.label(),
        "endpoints_active": true,
    }))
}

async fn model_status(State(state): State<AppState>) -> Json<ModelStatus> {
    let models_loaded = state.service().models_loaded();
    Json(ModelStatus {
        models_loaded,
        status: if models_loaded { "ready" } else { "not_loaded" },
    })
}

async fn generate(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<GenerationResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let result = state.service().generate(upload).await?;

    let image = image_to_base64_png(&result.image).map_err(|e| ApiError::Encode(format!("{e:#}")))?;
    let (width, height) = result.dimensions();
    Ok(Json(GenerationResponse {
        success: true,
        image,
        generation_time: result.elapsed_seconds(),
        prompt: result.prompt,
        image_size: [width, height],
        message: "Image generated successfully",
    }))
}

async fn read_upload(mut multipart: Multipart) -> Result<SketchUpload, ApiError> {
    let mut upload = SketchUpload::default();
    let mut has_file = false;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if has_file {
                    return Err(scribble_core::SketchError::validation(
                        "Only one file may be uploaded per request",
                    )
                    .into());
                }
                upload.filename = field.file_name().map(str::to_string);
                upload.content_type = field.content_type().map(str::to_string);
                upload.bytes = field.bytes().await?.to_vec();
                has_file = true;
            }
            "prompt" => upload.prompt = field.text().await?,
            "steps" => upload.steps = parse_field(&name, &field.text().await?)?,
            "guidance_scale" => upload.guidance_scale = parse_field(&name, &field.text().await?)?,
            "seed" => upload.seed = parse_field(&name, &field.text().await?)?,
            _ => tracing::debug!(field = %name, "ignoring unknown form field"),
        }
    }

    if !has_file {
        return Err(scribble_core::SketchError::validation("Missing required form field: file").into());
    }
    Ok(upload)
}

/// Empty values count as absent.
fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<Option<T>, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| ApiError::Field {
        field: field.to_string(),
        value: value.to_string(),
    })
}
