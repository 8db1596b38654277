use anyhow::Result;
use candle_core::{DType, Device};
use serde::Serialize;

use crate::util::select_best_device;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AcceleratorKind {
    #[serde(rename = "CUDA")]
    Cuda,
    #[serde(rename = "Metal")]
    Metal,
    #[serde(rename = "CPU")]
    Cpu,
}

impl AcceleratorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cuda => "CUDA",
            Self::Metal => "Metal",
            Self::Cpu => "CPU",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

/// Device and numeric precision every model is built for.
///
/// Resolved once when the model cache is constructed: accelerators run in
/// half precision, the CPU fallback in full precision.
#[derive(Clone, Debug)]
pub struct ComputeTarget {
    pub device: Device,
    pub dtype: DType,
    pub kind: AcceleratorKind,
}

impl ComputeTarget {
    pub fn resolve(device_map: DeviceMap) -> Result<Self> {
        let device = select_best_device(device_map)?;
        let kind = match &device {
            Device::Cuda(_) => AcceleratorKind::Cuda,
            Device::Metal(_) => AcceleratorKind::Metal,
            Device::Cpu => AcceleratorKind::Cpu,
        };
        let dtype = if kind.is_accelerator() {
            DType::F16
        } else {
            DType::F32
        };
        Ok(Self { device, dtype, kind })
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            kind: AcceleratorKind::Cpu,
        }
    }

    pub fn use_f16(&self) -> bool {
        self.dtype == DType::F16
    }
}
