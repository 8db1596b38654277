use std::sync::Arc;

use image::DynamicImage;
use tracing::info;

use crate::{ConditioningImage, GenerationRequest, ModelCache, SketchError};

/// Prompt used when the caller leaves the prompt empty.
pub const DEFAULT_PROMPT: &str = "high quality, detailed, realistic";
/// Always steers sampling away from these.
pub const NEGATIVE_PROMPT: &str = "low quality, blurry, distorted, deformed, ugly, bad anatomy";
/// Full adherence to the sketch structure.
pub const CONDITIONING_SCALE: f64 = 1.0;
pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

impl GenerationRequest {
    /// Resolves the effective prompt and pins the fixed sampling parameters.
    pub fn new(prompt: &str, steps: usize, guidance_scale: f64, seed: Option<u64>) -> Self {
        let prompt = if prompt.is_empty() {
            DEFAULT_PROMPT
        } else {
            prompt
        };
        Self {
            prompt: prompt.to_string(),
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            steps,
            guidance_scale,
            conditioning_scale: CONDITIONING_SCALE,
            seed,
        }
    }
}

pub struct GeneratedImage {
    pub image: DynamicImage,
    pub request: GenerationRequest,
}

/// Runs one inference call against the cached pipeline.
#[derive(Clone)]
pub struct GenerationEngine {
    cache: Arc<ModelCache>,
}

impl GenerationEngine {
    pub fn new(cache: Arc<ModelCache>) -> Self {
        Self { cache }
    }

    pub async fn generate(
        &self,
        conditioning: ConditioningImage,
        prompt: &str,
        steps: usize,
        guidance_scale: f64,
        seed: Option<u64>,
    ) -> Result<GeneratedImage, SketchError> {
        let pipeline = self.cache.ensure_loaded().await?;
        let request = GenerationRequest::new(prompt, steps, guidance_scale, seed);
        info!(
            prompt = %request.prompt,
            steps,
            guidance_scale,
            seed = ?seed,
            "generating image"
        );

        let job = request.clone();
        let image = tokio::task::spawn_blocking(move || pipeline.run(&job, &conditioning))
            .await
            .map_err(|e| SketchError::Generation(format!("inference worker panicked: {e}")))?
            .map_err(|e| SketchError::generation(&e))?;

        Ok(GeneratedImage { image, request })
    }
}
