#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod cache;
pub mod device_map;
pub mod engine;
mod error;
pub mod loader;
pub mod preprocess;
pub mod service;
mod util;

mod controlnet;
mod hed;

pub use cache::*;
pub use controlnet::ControlNetLoader;
pub use device_map::*;
pub use engine::*;
pub use error::SketchError;
pub use hed::HedLoader;
pub use loader::*;
pub use preprocess::*;
pub use service::*;
pub use util::{accelerator_probe, tensor_to_image};
pub(crate) use util::*;

use image::{DynamicImage, GrayImage, RgbImage};

/// Side length of the square conditioning image the pipeline is trained on.
pub const CONDITIONING_SIZE: u32 = 512;

/// Single-channel structural map of a sketch, always `CONDITIONING_SIZE` square.
#[derive(Debug, Clone)]
pub struct ConditioningImage(GrayImage);

impl ConditioningImage {
    pub(crate) fn new(map: GrayImage) -> Self {
        Self(map)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn as_luma(&self) -> &GrayImage {
        &self.0
    }
}

/// One fully-resolved inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance_scale: f64,
    pub conditioning_scale: f64,
    pub seed: Option<u64>,
}

/// Text-and-structure guided image generator (the loaded pipeline).
pub trait SketchPipeline: Send + Sync {
    fn run(
        &self,
        request: &GenerationRequest,
        conditioning: &ConditioningImage,
    ) -> anyhow::Result<DynamicImage>;
}

/// Edge extractor producing a scribble-style map of the same size as its input.
pub trait EdgeDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> anyhow::Result<GrayImage>;
}
