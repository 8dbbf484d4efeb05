//! Compute device discovery and numeric precision policy.
//!
//! A [`DeviceSelection`] is made once per run and handed to the estimator and
//! the engine by value. Nothing here is global, so tests can drive the engine
//! with any profile without touching real hardware.

use std::fmt;

use half::f16;
use ndarray::{s, Array4, Zip};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SlowmoError};
use crate::padder::PaddedFrame;
use crate::types::{Frame, CHANNELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    #[serde(rename = "coreml")]
    CoreMl,
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrecisionProfile {
    FullCpu,
    FullGpu,
    HalfGpu,
}

impl PrecisionProfile {
    pub fn is_half(self) -> bool {
        matches!(self, Self::HalfGpu)
    }
}

impl fmt::Display for PrecisionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullCpu => write!(f, "fp32-cpu"),
            Self::FullGpu => write!(f, "fp32-gpu"),
            Self::HalfGpu => write!(f, "fp16-gpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    #[serde(rename = "coreml")]
    CoreMl,
}

impl DevicePreference {
    /// Parse from string (case-insensitive).
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "coreml" | "mps" => Ok(Self::CoreMl),
            other => Err(SlowmoError::configuration(format!(
                "unknown device '{other}' (expected auto, cpu, cuda or coreml)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionPreference {
    #[default]
    Auto,
    Full,
    Half,
}

impl PrecisionPreference {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "full" | "fp32" => Ok(Self::Full),
            "half" | "fp16" => Ok(Self::Half),
            other => Err(SlowmoError::configuration(format!(
                "unknown precision '{other}' (expected auto, full or half)"
            ))),
        }
    }
}

/// Reports which accelerated execution providers can be used in this process.
pub trait DeviceProbe {
    fn coreml_available(&self) -> bool;
    fn cuda_available(&self) -> bool;
}

/// Asks ONNX Runtime which execution providers were compiled in and can load.
pub struct OrtDeviceProbe;

impl DeviceProbe for OrtDeviceProbe {
    fn coreml_available(&self) -> bool {
        CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }

    fn cuda_available(&self) -> bool {
        CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
}

/// Device and precision chosen for a run. Fixed once streaming starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelection {
    pub device: ComputeDevice,
    pub profile: PrecisionProfile,
}

impl DeviceSelection {
    pub fn cpu() -> Self {
        Self {
            device: ComputeDevice::Cpu,
            profile: PrecisionProfile::FullCpu,
        }
    }

    /// Downgrade half precision to full when the loaded model only takes f32 inputs.
    ///
    /// The reverse case needs no change: an f16 model is fed converted tensors
    /// and its output is widened again before leaving the estimator.
    pub fn reconcile_with_model(self, model_accepts_half: bool) -> Self {
        if self.profile.is_half() && !model_accepts_half {
            warn!(
                device = %self.device,
                "Model declares f32 inputs; using full precision instead of half"
            );
            return Self {
                profile: PrecisionProfile::FullGpu,
                ..self
            };
        }
        self
    }
}

/// Pick the compute device and precision for a run.
///
/// Discovery order for `Auto` is CoreML, then CUDA, then CPU. CoreML stays at
/// full precision because half precision on that backend produces unstable
/// output; CUDA defaults to half.
pub fn select_profile(
    probe: &dyn DeviceProbe,
    device: DevicePreference,
    precision: PrecisionPreference,
) -> Result<DeviceSelection> {
    let chosen = match device {
        DevicePreference::Auto => {
            if probe.coreml_available() {
                ComputeDevice::CoreMl
            } else if probe.cuda_available() {
                ComputeDevice::Cuda
            } else {
                ComputeDevice::Cpu
            }
        }
        DevicePreference::Cpu => ComputeDevice::Cpu,
        DevicePreference::Cuda => {
            if !probe.cuda_available() {
                return Err(SlowmoError::configuration(
                    "CUDA was requested but the CUDA execution provider is not available",
                ));
            }
            ComputeDevice::Cuda
        }
        DevicePreference::CoreMl => {
            if !probe.coreml_available() {
                return Err(SlowmoError::configuration(
                    "CoreML was requested but the CoreML execution provider is not available",
                ));
            }
            ComputeDevice::CoreMl
        }
    };

    let profile = match (chosen, precision) {
        (ComputeDevice::Cpu, PrecisionPreference::Half) => {
            return Err(SlowmoError::configuration(
                "half precision is not supported on the CPU device",
            ));
        }
        (ComputeDevice::Cpu, _) => PrecisionProfile::FullCpu,
        (_, PrecisionPreference::Full) => PrecisionProfile::FullGpu,
        (_, PrecisionPreference::Half) => PrecisionProfile::HalfGpu,
        (ComputeDevice::CoreMl, PrecisionPreference::Auto) => PrecisionProfile::FullGpu,
        (ComputeDevice::Cuda, PrecisionPreference::Auto) => PrecisionProfile::HalfGpu,
    };

    info!(device = %chosen, precision = %profile, "Selected compute device");
    Ok(DeviceSelection {
        device: chosen,
        profile,
    })
}

/// NCHW, batch 1, values normalized to 0.0..=1.0.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTensor {
    Full(Array4<f32>),
    Half(Array4<f16>),
}

impl ModelTensor {
    /// `(batch, channels, height, width)`
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        match self {
            Self::Full(arr) => arr.dim(),
            Self::Half(arr) => arr.dim(),
        }
    }

    pub fn is_half(&self) -> bool {
        matches!(self, Self::Half(_))
    }

    pub fn to_f32(&self) -> Array4<f32> {
        match self {
            Self::Full(arr) => arr.clone(),
            Self::Half(arr) => arr.mapv(f16::to_f32),
        }
    }

    pub fn to_f16(&self) -> Array4<f16> {
        match self {
            Self::Full(arr) => arr.mapv(f16::from_f32),
            Self::Half(arr) => arr.clone(),
        }
    }

    /// Convert to the element type `profile` calls for.
    pub fn with_profile(self, profile: PrecisionProfile) -> Self {
        match (self, profile.is_half()) {
            (Self::Full(arr), true) => Self::Half(arr.mapv(f16::from_f32)),
            (Self::Half(arr), false) => Self::Full(arr.mapv(f16::to_f32)),
            (tensor, _) => tensor,
        }
    }

    /// Mirror along the width axis.
    pub fn flip_horizontal(&self) -> Self {
        match self {
            Self::Full(arr) => Self::Full(arr.slice(s![.., .., .., ..;-1]).to_owned()),
            Self::Half(arr) => Self::Half(arr.slice(s![.., .., .., ..;-1]).to_owned()),
        }
    }

    /// Element-wise mean of two tensors of the same shape, in the element type of `self`.
    pub fn average(&self, other: &Self) -> Result<Self> {
        if self.dims() != other.dims() {
            let (_, _, h0, w0) = self.dims();
            let (_, _, h1, w1) = other.dims();
            return Err(SlowmoError::ShapeMismatch {
                first_width: w0 as u32,
                first_height: h0 as u32,
                second_width: w1 as u32,
                second_height: h1 as u32,
            });
        }
        let a = self.to_f32();
        let b = other.to_f32();
        let mut mean = Array4::<f32>::zeros(a.dim());
        Zip::from(&mut mean)
            .and(&a)
            .and(&b)
            .for_each(|m, &x, &y| *m = (x + y) * 0.5);
        Ok(match self {
            Self::Full(_) => Self::Full(mean),
            Self::Half(_) => Self::Half(mean.mapv(f16::from_f32)),
        })
    }
}

/// Converts frames to and from the tensors the estimator consumes.
///
/// Tensors are built on the host; the execution provider the session was
/// built with moves them onto the selected device for each call.
#[derive(Debug, Clone, Copy)]
pub struct PrecisionManager {
    selection: DeviceSelection,
}

impl PrecisionManager {
    pub fn new(selection: DeviceSelection) -> Self {
        debug!(device = %selection.device, precision = %selection.profile, "Precision manager ready");
        Self { selection }
    }

    pub fn selection(&self) -> DeviceSelection {
        self.selection
    }

    pub fn profile(&self) -> PrecisionProfile {
        self.selection.profile
    }

    pub fn to_device_and_precision(&self, padded: &PaddedFrame) -> ModelTensor {
        let tensor = rgb_to_nchw(padded.frame());
        if self.selection.profile.is_half() {
            ModelTensor::Half(tensor.mapv(f16::from_f32))
        } else {
            ModelTensor::Full(tensor)
        }
    }

    /// Back to 8-bit RGB with round-to-nearest and clamping, whatever the tensor's precision.
    pub fn to_frame(&self, tensor: &ModelTensor) -> Result<Frame> {
        let (n, c, h, w) = tensor.dims();
        if n != 1 || c != CHANNELS {
            return Err(SlowmoError::inference(format!(
                "estimator returned tensor of shape [{n}, {c}, {h}, {w}], expected [1, 3, H, W]"
            )));
        }
        let data = nchw_to_rgb(&tensor.to_f32(), h, w);
        Frame::new(w as u32, h as u32, data)
            .map_err(|e| SlowmoError::inference(format!("invalid estimator output: {e}")))
    }
}

fn rgb_to_nchw(frame: &Frame) -> Array4<f32> {
    let h = frame.height() as usize;
    let w = frame.width() as usize;
    let data = frame.data();
    Array4::from_shape_fn((1, CHANNELS, h, w), |(_, c, y, x)| {
        data[(y * w + x) * CHANNELS + c] as f32 / 255.0
    })
}

fn nchw_to_rgb(arr: &Array4<f32>, h: usize, w: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; h * w * CHANNELS];
    for ((_, c, y, x), value) in arr.indexed_iter() {
        rgb[(y * w + x) * CHANNELS + c] = (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::padder::pad;

    struct FakeProbe {
        coreml: bool,
        cuda: bool,
    }

    impl DeviceProbe for FakeProbe {
        fn coreml_available(&self) -> bool {
            self.coreml
        }

        fn cuda_available(&self) -> bool {
            self.cuda
        }
    }

    const NONE: FakeProbe = FakeProbe {
        coreml: false,
        cuda: false,
    };
    const CUDA_ONLY: FakeProbe = FakeProbe {
        coreml: false,
        cuda: true,
    };
    const BOTH: FakeProbe = FakeProbe {
        coreml: true,
        cuda: true,
    };

    fn auto(probe: &FakeProbe) -> DeviceSelection {
        select_profile(probe, DevicePreference::Auto, PrecisionPreference::Auto).unwrap()
    }

    #[test]
    fn auto_prefers_coreml_then_cuda_then_cpu() {
        assert_eq!(auto(&BOTH).device, ComputeDevice::CoreMl);
        assert_eq!(auto(&CUDA_ONLY).device, ComputeDevice::Cuda);
        assert_eq!(auto(&NONE).device, ComputeDevice::Cpu);
    }

    #[test]
    fn auto_precision_follows_device() {
        assert_eq!(auto(&BOTH).profile, PrecisionProfile::FullGpu);
        assert_eq!(auto(&CUDA_ONLY).profile, PrecisionProfile::HalfGpu);
        assert_eq!(auto(&NONE).profile, PrecisionProfile::FullCpu);
    }

    #[test]
    fn forced_device_must_be_available() {
        let err = select_profile(&NONE, DevicePreference::Cuda, PrecisionPreference::Auto)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let forced_cpu =
            select_profile(&BOTH, DevicePreference::Cpu, PrecisionPreference::Auto).unwrap();
        assert_eq!(forced_cpu, DeviceSelection::cpu());
    }

    #[test]
    fn half_on_cpu_is_rejected() {
        let err = select_profile(&NONE, DevicePreference::Auto, PrecisionPreference::Half)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn forced_full_precision_on_cuda() {
        let selection =
            select_profile(&CUDA_ONLY, DevicePreference::Cuda, PrecisionPreference::Full)
                .unwrap();
        assert_eq!(selection.profile, PrecisionProfile::FullGpu);
    }

    #[test]
    fn reconcile_downgrades_for_f32_models() {
        let selection = auto(&CUDA_ONLY).reconcile_with_model(false);
        assert_eq!(selection.profile, PrecisionProfile::FullGpu);
        assert_eq!(selection.device, ComputeDevice::Cuda);
        assert_eq!(auto(&CUDA_ONLY).reconcile_with_model(true), auto(&CUDA_ONLY));
        assert_eq!(auto(&NONE).reconcile_with_model(false), auto(&NONE));
    }

    #[test]
    fn preference_parsing() {
        assert_eq!(DevicePreference::parse("CUDA").unwrap(), DevicePreference::Cuda);
        assert_eq!(DevicePreference::parse("mps").unwrap(), DevicePreference::CoreMl);
        assert!(DevicePreference::parse("tpu").is_err());
        assert_eq!(PrecisionPreference::parse("fp16").unwrap(), PrecisionPreference::Half);
    }

    #[test]
    fn frame_tensor_round_trip_is_lossless_in_both_precisions() {
        let data: Vec<u8> = (0..32 * 32 * 3).map(|i| (i % 256) as u8).collect();
        let frame = Frame::new(32, 32, data).unwrap();
        let padded = pad(&frame).unwrap();

        for selection in [
            DeviceSelection::cpu(),
            DeviceSelection {
                device: ComputeDevice::Cuda,
                profile: PrecisionProfile::HalfGpu,
            },
        ] {
            let manager = PrecisionManager::new(selection);
            let tensor = manager.to_device_and_precision(&padded);
            assert_eq!(tensor.dims(), (1, 3, 32, 32));
            assert_eq!(tensor.is_half(), selection.profile.is_half());
            assert_eq!(manager.to_frame(&tensor).unwrap(), frame);
        }
    }

    #[test]
    fn to_frame_clamps_out_of_range_values() {
        let mut arr = Array4::<f32>::zeros((1, 3, 1, 2));
        arr[[0, 0, 0, 0]] = 1.7;
        arr[[0, 1, 0, 0]] = -0.3;
        arr[[0, 2, 0, 1]] = 0.5;
        let manager = PrecisionManager::new(DeviceSelection::cpu());
        let frame = manager.to_frame(&ModelTensor::Full(arr)).unwrap();
        assert_eq!(frame.pixel(0, 0).unwrap(), [255, 0, 0]);
        assert_eq!(frame.pixel(1, 0).unwrap(), [0, 0, 128]);
    }

    #[test]
    fn to_frame_rejects_wrong_channel_count() {
        let manager = PrecisionManager::new(DeviceSelection::cpu());
        let tensor = ModelTensor::Full(Array4::zeros((1, 4, 2, 2)));
        assert_eq!(manager.to_frame(&tensor).unwrap_err().kind(), ErrorKind::Inference);
    }

    #[test]
    fn flip_and_average() {
        let arr = Array4::from_shape_vec((1, 1, 1, 3), vec![0.0, 0.5, 1.0]).unwrap();
        let tensor = ModelTensor::Full(arr);
        let flipped = tensor.flip_horizontal();
        assert_eq!(flipped.to_f32().as_slice().unwrap(), &[1.0, 0.5, 0.0]);
        assert_eq!(flipped.flip_horizontal(), tensor);

        let mean = tensor.average(&flipped).unwrap();
        assert_eq!(mean.to_f32().as_slice().unwrap(), &[0.5, 0.5, 0.5]);

        let other = ModelTensor::Full(Array4::zeros((1, 1, 2, 3)));
        assert_eq!(tensor.average(&other).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn with_profile_switches_element_type() {
        let tensor = ModelTensor::Full(Array4::from_elem((1, 3, 2, 2), 0.25));
        let half = tensor.clone().with_profile(PrecisionProfile::HalfGpu);
        assert!(half.is_half());
        assert_eq!(half.with_profile(PrecisionProfile::FullCpu), tensor);
    }
}
