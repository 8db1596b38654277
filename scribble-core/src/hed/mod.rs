mod model;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::tokio::Api;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use imageproc::filter::gaussian_blur_f32;

use crate::{fetch, ComputeTarget, EdgeDetector, Loader, ModelRepos};

const WEIGHTS_FILE: &str = "ControlNetHED.pth";
const NMS_THRESHOLD: u8 = 127;
const BLUR_SIGMA: f32 = 3.0;
const SCRIBBLE_CUTOFF: u8 = 4;

/// Neighbour pairs for horizontal, vertical, diagonal and anti-diagonal ridges.
const RIDGE_DIRECTIONS: [[(i64, i64); 2]; 4] = [
    [(-1, 0), (1, 0)],
    [(0, -1), (0, 1)],
    [(-1, -1), (1, 1)],
    [(1, -1), (-1, 1)],
];

pub struct HedDetector {
    model: model::Hed,
    device: Device,
}

impl HedDetector {
    fn edge_probabilities(&self, image: &RgbImage) -> Result<GrayImage> {
        let (width, height) = image.dimensions();
        let pixels = Tensor::from_vec(
            image.as_raw().clone(),
            (1, height as usize, width as usize, 3),
            &self.device,
        )?
        .permute((0, 3, 1, 2))?
        .to_dtype(DType::F32)?;

        let sides = self.model.forward(&pixels)?;
        let mut fused = vec![0f32; (width * height) as usize];
        for side in &sides {
            let (_, _, side_h, side_w) = side.dims4()?;
            let values = side.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
            let side_map: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(side_w as u32, side_h as u32, values)
                    .context("side output does not match its shape")?;
            let side_map = imageops::resize(&side_map, width, height, FilterType::Triangle);
            for (acc, value) in fused.iter_mut().zip(side_map.as_raw()) {
                *acc += value;
            }
        }

        let n_sides = sides.len() as f32;
        let probabilities = fused
            .into_iter()
            .map(|sum| {
                let edge = 1.0 / (1.0 + (-sum / n_sides).exp());
                (edge * 255.0).clamp(0.0, 255.0) as u8
            })
            .collect();
        GrayImage::from_raw(width, height, probabilities).context("edge map has the wrong size")
    }
}

impl EdgeDetector for HedDetector {
    fn detect(&self, image: &RgbImage) -> Result<GrayImage> {
        let edges = self.edge_probabilities(image)?;
        Ok(scribble(&edges))
    }
}

/// Turns a soft edge map into the thick binary strokes scribble conditioning expects.
pub(crate) fn scribble(edges: &GrayImage) -> GrayImage {
    let thinned = non_max_suppression(edges, NMS_THRESHOLD, BLUR_SIGMA);
    let mut strokes = gaussian_blur_f32(&thinned, BLUR_SIGMA);
    for pixel in strokes.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > SCRIBBLE_CUTOFF { 255 } else { 0 };
    }
    strokes
}

fn non_max_suppression(edges: &GrayImage, threshold: u8, sigma: f32) -> GrayImage {
    let smooth = gaussian_blur_f32(edges, sigma);
    let (width, height) = smooth.dimensions();
    let at = |x: i64, y: i64| -> Option<u8> {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            None
        } else {
            Some(smooth.get_pixel(x as u32, y as u32).0[0])
        }
    };

    GrayImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as i64, y as i64);
        let value = smooth.get_pixel(x as u32, y as u32).0[0];
        let on_ridge = RIDGE_DIRECTIONS.iter().any(|pair| {
            pair.iter()
                .all(|(dx, dy)| at(x + dx, y + dy).is_none_or(|n| n <= value))
        });
        if on_ridge && value > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Reads the checkpoint and builds the network on the blocking pool.
async fn build_detector(weights: PathBuf, device: Device) -> Result<HedDetector> {
    let build = move || -> Result<HedDetector> {
        // The annotator is small; it stays in full precision on every device.
        let vb = VarBuilder::from_pth(&weights, DType::F32, &device)
            .context("failed to read HED weights")?;
        let model = model::Hed::new(vb).context("failed to build HED network")?;
        Ok(HedDetector { model, device })
    };
    tokio::task::spawn_blocking(build)
        .await
        .context("HED construction panicked")?
}

pub struct HedLoader {
    api: Api,
    repos: ModelRepos,
}

impl HedLoader {
    pub fn new(api: Api, repos: ModelRepos) -> Self {
        Self { api, repos }
    }
}

#[async_trait]
impl Loader<dyn EdgeDetector> for HedLoader {
    async fn load(&self, target: &ComputeTarget) -> Result<Arc<dyn EdgeDetector>> {
        let weights = fetch(&self.api, &self.repos.annotator, WEIGHTS_FILE).await?;
        let detector = build_detector(weights, target.device.clone()).await?;
        Ok(Arc::new(detector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertical_stroke(width: u32, height: u32, column: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            if x.abs_diff(column) <= 2 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn blank_map_has_no_strokes() {
        let strokes = scribble(&GrayImage::new(64, 64));
        assert!(strokes.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn strokes_are_binary_and_follow_the_edge() {
        let strokes = scribble(&vertical_stroke(96, 64, 48));

        assert_eq!(strokes.dimensions(), (96, 64));
        assert!(strokes.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert_eq!(strokes.get_pixel(48, 32).0[0], 255);
        assert_eq!(strokes.get_pixel(5, 32).0[0], 0);
        assert_eq!(strokes.get_pixel(90, 32).0[0], 0);
    }

    #[test]
    fn suppression_keeps_only_the_ridge_above_threshold() {
        let thinned = non_max_suppression(&vertical_stroke(64, 32, 32), NMS_THRESHOLD, 1.0);
        assert_eq!(thinned.get_pixel(32, 16).0[0], 255);
        assert_eq!(thinned.get_pixel(10, 16).0[0], 0);
    }

    #[test]
    fn faint_edges_are_dropped() {
        let faint = GrayImage::from_fn(64, 64, |x, _| {
            if x == 32 {
                Luma([100])
            } else {
                Luma([0])
            }
        });
        let strokes = scribble(&faint);
        assert!(strokes.pixels().all(|p| p.0[0] == 0));
    }

    #[tokio::test]
    async fn unreadable_checkpoint_fails_without_a_detector() {
        let missing = std::env::temp_dir().join("scribble-missing-ControlNetHED.pth");
        let err = build_detector(missing, Device::Cpu).await.err().unwrap();
        assert!(format!("{err:#}").contains("failed to read HED weights"));
    }
}
