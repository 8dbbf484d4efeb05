//! ONNX Runtime session construction for the selected compute device.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, CoreMLExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

use crate::device::ComputeDevice;

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: ComputeDevice,
    /// CUDA device ordinal; ignored for other devices.
    pub device_id: i32,
}

/// Build an `ort::Session` bound to exactly one execution provider.
///
/// Accelerated providers are registered with `error_on_failure`, so a device
/// that cannot be initialized fails the build instead of silently running the
/// whole model on CPU.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let started = Instant::now();
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    debug!(
        device = %config.device,
        model = %config.model_path.display(),
        "Building ONNX session"
    );

    let session = match config.device {
        ComputeDevice::Cuda => builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build()
                .error_on_failure()])?
            .commit_from_file(config.model_path),
        ComputeDevice::CoreMl => builder
            .with_execution_providers([CoreMLExecutionProvider::default()
                .build()
                .error_on_failure()])?
            .commit_from_file(config.model_path),
        ComputeDevice::Cpu => builder.commit_from_file(config.model_path),
    }
    .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    info!(
        device = %config.device,
        elapsed_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0),
        "ONNX session ready"
    );

    Ok(session)
}
