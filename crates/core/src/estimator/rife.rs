//! RIFE midpoint estimation via `ort::Session`.
//!
//! Supports two ONNX model formats:
//! - **Three-input** (RIFE v4.6 and earlier): separate `img0`, `img1`, `timestep` tensors
//! - **Concatenated** (RIFE v4.22+): single `input` tensor of shape `[1, 7, H, W]`
//!   where channels are `[img0_rgb(3) + img1_rgb(3) + timestep_broadcast(1)]`
//!
//! The element type fed to the session follows what the model declares, not
//! the run's precision profile; outputs are converted back to the caller's
//! precision before returning.

use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result as AnyResult};
use half::f16;
use ndarray::{concatenate, Array4, Axis, Ix4};
use ort::{
    session::Session,
    tensor::{PrimitiveTensorElementType, TensorElementType},
    value::{Tensor, ValueType},
};
use tracing::{debug, info};

use super::session::{build_session, SessionConfig};
use super::{ensure_same_shape, FlowEstimator};
use crate::device::{DeviceSelection, ModelTensor, PrecisionProfile};
use crate::error::{Result, SlowmoError};

const INPUT_IMG0: &str = "img0";
const INPUT_IMG1: &str = "img1";
const INPUT_TIMESTEP: &str = "timestep";
/// Single concatenated input name for v4.22+ models
const INPUT_CONCAT: &str = "input";
const MIDPOINT: f32 = 0.5;

/// ONNX model input format detected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    ThreeInput,
    Concatenated,
}

#[derive(Debug, Clone)]
pub struct RifeOptions {
    pub model_path: PathBuf,
    /// Also run the horizontally mirrored pair and average both results.
    pub ensemble: bool,
    pub use_iobinding: bool,
    pub device_id: i32,
}

impl RifeOptions {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ensemble: false,
            use_iobinding: false,
            device_id: 0,
        }
    }
}

pub struct RifeEstimator {
    session: Session,
    format: ModelFormat,
    output_name: String,
    model_is_half: bool,
    ensemble: bool,
    use_iobinding: bool,
}

impl RifeEstimator {
    pub fn load(options: &RifeOptions, selection: DeviceSelection) -> Result<Self> {
        if !options.model_path.is_file() {
            return Err(SlowmoError::configuration(format!(
                "model file not found: {}",
                options.model_path.display()
            )));
        }

        let session = build_session(&SessionConfig {
            model_path: &options.model_path,
            device: selection.device,
            device_id: options.device_id,
        })
        .map_err(|e| match SlowmoError::from_runtime(&e) {
            exhausted @ SlowmoError::ResourceExhausted(_) => exhausted,
            _ => SlowmoError::configuration(format!("{e:#}")),
        })?;

        let format = detect_model_format(&session);
        let model_is_half = match session.inputs().first().map(|input| input.dtype()) {
            Some(ValueType::Tensor { ty, .. }) => *ty == TensorElementType::Float16,
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| SlowmoError::configuration("model declares no outputs"))?;

        info!(
            model = %options.model_path.display(),
            format = ?format,
            model_is_half,
            ensemble = options.ensemble,
            use_iobinding = options.use_iobinding,
            "RIFE model loaded"
        );

        Ok(Self {
            session,
            format,
            output_name,
            model_is_half,
            ensemble: options.ensemble,
            use_iobinding: options.use_iobinding,
        })
    }

    pub fn format(&self) -> ModelFormat {
        self.format
    }

    /// Whether the model declares f16 inputs.
    pub fn accepts_half(&self) -> bool {
        self.model_is_half
    }

    fn run_once(&mut self, first: &ModelTensor, second: &ModelTensor) -> Result<ModelTensor> {
        let started = Instant::now();
        let caller_profile = if first.is_half() {
            PrecisionProfile::HalfGpu
        } else {
            PrecisionProfile::FullGpu
        };

        let result = if self.model_is_half {
            self.run_typed(first.to_f16(), second.to_f16(), f16::from_f32(MIDPOINT))
                .map(ModelTensor::Half)
        } else {
            self.run_typed(first.to_f32(), second.to_f32(), MIDPOINT)
                .map(ModelTensor::Full)
        }
        .map_err(|e| SlowmoError::from_runtime(&e))?;

        debug!(
            format = ?self.format,
            session_run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "RIFE midpoint timing"
        );

        Ok(result.with_profile(caller_profile))
    }

    fn run_typed<T>(&mut self, img0: Array4<T>, img1: Array4<T>, timestep: T) -> AnyResult<Array4<T>>
    where
        T: PrimitiveTensorElementType + Copy + Debug + 'static,
    {
        let output = match self.format {
            ModelFormat::Concatenated => {
                let concat = concat_inputs(&img0, &img1, timestep)?;
                let tensor = Tensor::from_array(concat)?;
                if self.use_iobinding {
                    let mut binding = self.session.create_binding()?;
                    binding.bind_input(INPUT_CONCAT, &tensor)?;
                    binding.bind_output_to_device(
                        self.output_name.as_str(),
                        &self.session.allocator().memory_info(),
                    )?;
                    let outputs = self.session.run_binding(&binding)?;
                    let view = outputs[self.output_name.as_str()].try_extract_array::<T>()?;
                    view.to_owned()
                } else {
                    let outputs = self.session.run(ort::inputs![INPUT_CONCAT => tensor])?;
                    let view = outputs[self.output_name.as_str()].try_extract_array::<T>()?;
                    view.to_owned()
                }
            }
            ModelFormat::ThreeInput => {
                let tensor0 = Tensor::from_array(img0)?;
                let tensor1 = Tensor::from_array(img1)?;
                let ts_tensor = Tensor::from_array(Array4::<T>::from_elem((1, 1, 1, 1), timestep))?;
                if self.use_iobinding {
                    let mut binding = self.session.create_binding()?;
                    binding.bind_input(INPUT_IMG0, &tensor0)?;
                    binding.bind_input(INPUT_IMG1, &tensor1)?;
                    binding.bind_input(INPUT_TIMESTEP, &ts_tensor)?;
                    binding.bind_output_to_device(
                        self.output_name.as_str(),
                        &self.session.allocator().memory_info(),
                    )?;
                    let outputs = self.session.run_binding(&binding)?;
                    let view = outputs[self.output_name.as_str()].try_extract_array::<T>()?;
                    view.to_owned()
                } else {
                    let outputs = self.session.run(ort::inputs![
                        INPUT_IMG0 => tensor0,
                        INPUT_IMG1 => tensor1,
                        INPUT_TIMESTEP => ts_tensor
                    ])?;
                    let view = outputs[self.output_name.as_str()].try_extract_array::<T>()?;
                    view.to_owned()
                }
            }
        };

        output
            .into_dimensionality::<Ix4>()
            .context("RIFE output is not a 4-D tensor")
    }
}

impl FlowEstimator for RifeEstimator {
    fn name(&self) -> &str {
        "RIFE"
    }

    fn midpoint(&mut self, first: &ModelTensor, second: &ModelTensor) -> Result<ModelTensor> {
        ensure_same_shape(first, second)?;
        let direct = self.run_once(first, second)?;
        if !self.ensemble {
            return Ok(direct);
        }
        let mirrored = self
            .run_once(&first.flip_horizontal(), &second.flip_horizontal())?
            .flip_horizontal();
        direct.average(&mirrored)
    }
}

fn detect_model_format(session: &Session) -> ModelFormat {
    let inputs = session.inputs();
    if inputs.len() == 1 && inputs[0].name() == INPUT_CONCAT {
        ModelFormat::Concatenated
    } else {
        ModelFormat::ThreeInput
    }
}

/// `[1, 7, H, W]`: img0 RGB, img1 RGB, then a plane filled with the timestep.
fn concat_inputs<T>(img0: &Array4<T>, img1: &Array4<T>, timestep: T) -> AnyResult<Array4<T>>
where
    T: Copy,
{
    let (_, _, h, w) = img0.dim();
    let plane = Array4::from_elem((1, 1, h, w), timestep);
    concatenate(Axis(1), &[img0.view(), img1.view(), plane.view()])
        .context("failed to build concatenated RIFE input")
}
