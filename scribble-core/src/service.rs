use std::sync::Arc;
use std::time::{Duration, Instant};

use image::DynamicImage;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    decode_sketch, GenerationEngine, ModelCache, SketchError, SketchPreprocessor,
    DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS,
};

const IMAGE_MEDIA_TYPE: &str = "image/";

/// A sketch upload as received from the transport layer.
#[derive(Debug, Clone, Default)]
pub struct SketchUpload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub prompt: String,
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
}

/// Sampling parameters applied when an upload does not set its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDefaults {
    pub steps: usize,
    pub guidance_scale: f64,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }
}

pub struct GenerationResult {
    pub image: DynamicImage,
    /// The prompt actually sent to the pipeline.
    pub prompt: String,
    pub elapsed: Duration,
}

impl GenerationResult {
    /// Elapsed wall-clock seconds rounded to two decimals.
    pub fn elapsed_seconds(&self) -> f64 {
        (self.elapsed.as_secs_f64() * 100.0).round() / 100.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

pub fn validate_content_type(content_type: Option<&str>) -> Result<(), SketchError> {
    match content_type {
        Some(ct) if ct.starts_with(IMAGE_MEDIA_TYPE) => Ok(()),
        Some(ct) => Err(SketchError::validation(format!(
            "Invalid file type: {ct}. Please upload an image."
        ))),
        None => Err(SketchError::validation(
            "Missing file content type. Please upload an image.",
        )),
    }
}

/// Drives one sketch through preprocessing and generation.
///
/// The compute device is exclusive: a request holds the device gate from
/// preprocessing until its image is produced, even if the caller stops waiting.
pub struct SketchService {
    cache: Arc<ModelCache>,
    preprocessor: SketchPreprocessor,
    engine: GenerationEngine,
    device_gate: Arc<Mutex<()>>,
    defaults: SamplingDefaults,
}

impl SketchService {
    pub fn new(cache: Arc<ModelCache>, defaults: SamplingDefaults) -> Self {
        Self {
            preprocessor: SketchPreprocessor::new(Arc::clone(&cache)),
            engine: GenerationEngine::new(Arc::clone(&cache)),
            cache,
            device_gate: Arc::new(Mutex::new(())),
            defaults,
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn models_loaded(&self) -> bool {
        self.cache.is_loaded()
    }

    /// Loads both models ahead of the first request.
    pub async fn warm_up(&self) -> Result<(), SketchError> {
        self.cache.ensure_detector().await?;
        self.cache.ensure_loaded().await?;
        Ok(())
    }

    pub async fn generate(&self, upload: SketchUpload) -> Result<GenerationResult, SketchError> {
        validate_content_type(upload.content_type.as_deref())?;
        let steps = upload.steps.unwrap_or(self.defaults.steps);
        if steps == 0 {
            return Err(SketchError::validation("steps must be a positive integer"));
        }
        let guidance_scale = upload.guidance_scale.unwrap_or(self.defaults.guidance_scale);
        if !guidance_scale.is_finite() || guidance_scale <= 0.0 {
            return Err(SketchError::validation(
                "guidance_scale must be a positive number",
            ));
        }

        info!(
            filename = upload.filename.as_deref().unwrap_or("<unnamed>"),
            bytes = upload.bytes.len(),
            has_prompt = !upload.prompt.is_empty(),
            "received sketch"
        );
        let bytes = upload.bytes;
        let sketch = tokio::task::spawn_blocking(move || decode_sketch(&bytes))
            .await
            .map_err(|e| SketchError::preprocess(format!("image decoding panicked: {e}")))??;

        // The job owns the gate, so device work outlives a caller that went away.
        let device = Arc::clone(&self.device_gate).lock_owned().await;
        let start = Instant::now();
        let preprocessor = self.preprocessor.clone();
        let engine = self.engine.clone();
        let prompt = upload.prompt;
        let seed = upload.seed;
        let job = tokio::spawn(async move {
            let _device = device;
            let conditioning = preprocessor.preprocess(&sketch).await?;
            engine
                .generate(conditioning, &prompt, steps, guidance_scale, seed)
                .await
        });
        let outcome = match job.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SketchError::Generation(format!(
                "generation task failed: {e}"
            ))),
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok(generated) => {
                info!(elapsed = ?elapsed, "sketch generated");
                Ok(GenerationResult {
                    image: generated.image,
                    prompt: generated.request.prompt,
                    elapsed,
                })
            }
            Err(err) => {
                warn!(elapsed = ?elapsed, error = %err, "sketch generation failed");
                Err(err)
            }
        }
    }
}
