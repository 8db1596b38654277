use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use scribble_core::{
    ComputeTarget, ConditioningImage, EdgeDetector, GenerationRequest, Loader, ModelCache,
    SamplingDefaults, SketchPipeline, SketchService, DEFAULT_PROMPT,
};
use scribble_server::{build_router, AppState, RouterOptions};
use serde_json::Value;
use tower::util::ServiceExt;

const BOUNDARY: &str = "scribble-test-boundary";

struct SolidPipeline;

impl SketchPipeline for SolidPipeline {
    fn run(
        &self,
        _request: &GenerationRequest,
        conditioning: &ConditioningImage,
    ) -> anyhow::Result<DynamicImage> {
        std::thread::sleep(Duration::from_millis(20));
        let (w, h) = conditioning.dimensions();
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 40, 40]))))
    }
}

struct LumaDetector;

impl EdgeDetector for LumaDetector {
    fn detect(&self, image: &RgbImage) -> anyhow::Result<GrayImage> {
        Ok(DynamicImage::ImageRgb8(image.clone()).to_luma8())
    }
}

#[derive(Default)]
struct FakeLoader {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeLoader {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Loader<dyn SketchPipeline> for FakeLoader {
    async fn load(&self, _target: &ComputeTarget) -> anyhow::Result<Arc<dyn SketchPipeline>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("out of memory while allocating unet weights");
        }
        Ok(Arc::new(SolidPipeline))
    }
}

#[async_trait]
impl Loader<dyn EdgeDetector> for FakeLoader {
    async fn load(&self, _target: &ComputeTarget) -> anyhow::Result<Arc<dyn EdgeDetector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LumaDetector))
    }
}

struct Harness {
    app: Router,
    service: Arc<SketchService>,
    pipeline_loader: Arc<FakeLoader>,
}

fn harness_with(pipeline_loader: FakeLoader) -> Harness {
    let pipeline_loader = Arc::new(pipeline_loader);
    let cache = ModelCache::new(
        ComputeTarget::cpu(),
        Arc::clone(&pipeline_loader) as Arc<dyn Loader<dyn SketchPipeline>>,
        Arc::new(FakeLoader::default()),
    );
    let service = Arc::new(SketchService::new(
        Arc::new(cache),
        SamplingDefaults::default(),
    ));
    let app = build_router(
        AppState::new(Arc::clone(&service)),
        &RouterOptions::default(),
    )
    .unwrap();
    Harness {
        app,
        service,
        pipeline_loader,
    }
}

fn harness() -> Harness {
    harness_with(FakeLoader::default())
}

fn circle_sketch() -> Vec<u8> {
    let mut sketch = RgbImage::from_pixel(256, 256, Rgb([255, 255, 255]));
    for (x, y, pixel) in sketch.enumerate_pixels_mut() {
        let (dx, dy) = (x as f32 - 128.0, y as f32 - 128.0);
        let r = (dx * dx + dy * dy).sqrt();
        if (r - 80.0).abs() < 3.0 {
            *pixel = Rgb([0, 0, 0]);
        }
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(sketch)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

enum Part<'a> {
    File {
        filename: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    },
    Text(&'a str, &'a str),
}

fn multipart_request(parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File {
                filename,
                content_type,
                bytes,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/generate")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn root_lists_endpoints() {
    let h = harness();
    let (status, body) = send(&h.app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["endpoints"]["generate"], "/generate (POST)");
    assert_eq!(body["endpoints"]["models_status"], "/models/status");
}

#[tokio::test]
async fn health_reports_accelerator_fields() {
    let h = harness();
    let (status, body) = send(&h.app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["endpoints_active"], true);
    assert!(body["gpu_available"].is_boolean());
    assert!(["CUDA", "Metal", "CPU"].contains(&body["gpu_type"].as_str().unwrap()));
}

#[tokio::test]
async fn status_flips_to_ready_after_first_generation() {
    let h = harness();

    let (_, before) = send(&h.app, get("/models/status")).await;
    assert_eq!(before["models_loaded"], false);
    assert_eq!(before["status"], "not_loaded");
    assert_eq!(h.pipeline_loader.calls.load(Ordering::SeqCst), 0);

    let sketch = circle_sketch();
    let (status, _) = send(
        &h.app,
        multipart_request(&[Part::File {
            filename: "circle.png",
            content_type: "image/png",
            bytes: &sketch,
        }]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, after) = send(&h.app, get("/models/status")).await;
    assert_eq!(after["models_loaded"], true);
    assert_eq!(after["status"], "ready");
}

#[tokio::test]
async fn generates_png_from_circle_sketch() {
    let h = harness();
    let sketch = circle_sketch();

    let (status, body) = send(
        &h.app,
        multipart_request(&[
            Part::File {
                filename: "circle.png",
                content_type: "image/png",
                bytes: &sketch,
            },
            Part::Text("prompt", "a red balloon, photorealistic"),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["prompt"], "a red balloon, photorealistic");
    assert_eq!(body["message"], "Image generated successfully");
    assert!(body["generation_time"].as_f64().unwrap() > 0.0);

    let png = BASE64_STANDARD
        .decode(body["image"].as_str().unwrap())
        .unwrap();
    let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
    let size = body["image_size"].as_array().unwrap();
    assert_eq!(size[0].as_u64().unwrap(), u64::from(decoded.width()));
    assert_eq!(size[1].as_u64().unwrap(), u64::from(decoded.height()));
    assert!(decoded.width() > 0 && decoded.height() > 0);
}

#[tokio::test]
async fn empty_prompt_falls_back_to_default() {
    let h = harness();
    let sketch = circle_sketch();

    let (status, body) = send(
        &h.app,
        multipart_request(&[
            Part::File {
                filename: "circle.png",
                content_type: "image/png",
                bytes: &sketch,
            },
            Part::Text("prompt", ""),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prompt"], DEFAULT_PROMPT);
}

#[tokio::test]
async fn non_image_upload_is_rejected_before_any_load() {
    let h = harness();

    let (status, body) = send(
        &h.app,
        multipart_request(&[Part::File {
            filename: "notes.png",
            content_type: "text/plain",
            bytes: b"definitely not pixels",
        }]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Invalid file type: text/plain"));
    assert!(body.get("generation_time").is_none());
    assert_eq!(h.pipeline_loader.calls.load(Ordering::SeqCst), 0);
    assert!(!h.service.models_loaded());
}

#[tokio::test]
async fn missing_file_is_a_bad_request() {
    let h = harness();

    let (status, body) = send(
        &h.app,
        multipart_request(&[Part::Text("prompt", "a lighthouse")]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("file"));
}

#[tokio::test]
async fn second_file_field_is_a_bad_request() {
    let h = harness();
    let sketch = circle_sketch();

    let (status, body) = send(
        &h.app,
        multipart_request(&[
            Part::File {
                filename: "circle.png",
                content_type: "image/png",
                bytes: &sketch,
            },
            Part::File {
                filename: "other.png",
                content_type: "image/png",
                bytes: &sketch,
            },
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("one file"));
    assert_eq!(h.pipeline_loader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_steps_is_a_bad_request() {
    let h = harness();
    let sketch = circle_sketch();

    let (status, _) = send(
        &h.app,
        multipart_request(&[
            Part::File {
                filename: "circle.png",
                content_type: "image/png",
                bytes: &sketch,
            },
            Part::Text("steps", "twenty"),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pipeline_load_failure_is_unavailable() {
    let h = harness_with(FakeLoader::failing());
    let sketch = circle_sketch();

    let (status, body) = send(
        &h.app,
        multipart_request(&[Part::File {
            filename: "circle.png",
            content_type: "image/png",
            bytes: &sketch,
        }]),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.starts_with("Generation failed: "), "{detail}");
    assert!(detail.contains("out of memory"));
    assert!(!h.service.models_loaded());
}

#[tokio::test]
async fn undecodable_image_is_unprocessable() {
    let h = harness();

    let (status, body) = send(
        &h.app,
        multipart_request(&[Part::File {
            filename: "broken.png",
            content_type: "image/png",
            bytes: b"\x89PNG but then nothing useful",
        }]),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].is_string());
    assert_eq!(h.pipeline_loader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cors_preflight_allows_dev_frontend() {
    let h = harness();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/generate")
        .header(header::ORIGIN, "http://localhost:5173")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();

    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:5173"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .unwrap(),
        "true"
    );
}
