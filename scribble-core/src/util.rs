use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GrayImage};

use crate::{AcceleratorKind, DeviceMap};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Best accelerator this build can reach, without creating a device context.
pub fn accelerator_probe() -> AcceleratorKind {
    if cuda_is_available() {
        AcceleratorKind::Cuda
    } else if metal_is_available() {
        AcceleratorKind::Metal
    } else {
        AcceleratorKind::Cpu
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Replicates a single-channel map into a (1, 3, height, width) tensor scaled to [0, 1].
pub fn gray_to_tensor(map: &GrayImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = map.dimensions();
    let plane = Tensor::from_vec(
        map.as_raw().clone(),
        (1, 1, height as usize, width as usize),
        device,
    )?;
    let planes = Tensor::cat(&[&plane, &plane, &plane], 1)?;
    let planes = (planes.to_dtype(DType::F32)? * (1. / 255.))?;
    Ok(planes.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_round_trips_into_rgb_image() {
        let data: Vec<u8> = (0..3 * 2 * 4).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(data, (3, 2, 4), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (4, 2));
        // channel planes are 8 values apart
        assert_eq!(image.get_pixel(0, 0).0, [0, 8, 16]);
        assert_eq!(image.get_pixel(3, 1).0, [7, 15, 23]);
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let tensor = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn gray_map_expands_to_three_unit_channels() {
        let map = GrayImage::from_pixel(8, 4, image::Luma([255]));
        let tensor = gray_to_tensor(&map, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor.dims4().unwrap(), (1, 3, 4, 8));
        let max = tensor.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!((max - 1.0).abs() < 1e-6);
    }
}
