use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::debug;

use crate::{ConditioningImage, ModelCache, SketchError, CONDITIONING_SIZE};

/// Decodes an uploaded file into a sketch image, sniffing the format from its bytes.
pub fn decode_sketch(bytes: &[u8]) -> Result<DynamicImage, SketchError> {
    image::load_from_memory(bytes)
        .map_err(|e| SketchError::preprocess(format!("cannot decode uploaded image: {e}")))
}

/// Three-channel color at the conditioning resolution.
pub fn normalize_sketch(image: &DynamicImage) -> RgbImage {
    let rgb = image.to_rgb8();
    if rgb.dimensions() == (CONDITIONING_SIZE, CONDITIONING_SIZE) {
        return rgb;
    }
    imageops::resize(&rgb, CONDITIONING_SIZE, CONDITIONING_SIZE, FilterType::Lanczos3)
}

fn fit_conditioning(map: GrayImage) -> GrayImage {
    if map.dimensions() == (CONDITIONING_SIZE, CONDITIONING_SIZE) {
        return map;
    }
    imageops::resize(&map, CONDITIONING_SIZE, CONDITIONING_SIZE, FilterType::Lanczos3)
}

/// Converts raw sketches into scribble conditioning maps.
#[derive(Clone)]
pub struct SketchPreprocessor {
    cache: Arc<ModelCache>,
}

impl SketchPreprocessor {
    pub fn new(cache: Arc<ModelCache>) -> Self {
        Self { cache }
    }

    pub async fn preprocess(&self, image: &DynamicImage) -> Result<ConditioningImage, SketchError> {
        let detector = self.cache.ensure_detector().await?;
        debug!(width = image.width(), height = image.height(), "preprocessing sketch");

        let rgb = normalize_sketch(image);
        let map = tokio::task::spawn_blocking(move || detector.detect(&rgb))
            .await
            .map_err(|e| SketchError::preprocess(format!("edge detection panicked: {e}")))?
            .map_err(|e| SketchError::preprocess(format!("edge detection failed: {e:#}")))?;

        Ok(ConditioningImage::new(fit_conditioning(map)))
    }
}
