//! Recursive midpoint interpolation.
//!
//! For a pair `(a, b)` and multiplier `2^n`, the midpoint `m` is estimated
//! once, then `(a, m)` and `(m, b)` are refined with depth `n - 1`. The result
//! is `left ++ [m] ++ right`: `2^n - 1` frames in temporal order, produced by
//! exactly `2^n - 1` estimator calls, each on two temporally adjacent frames.

use std::time::Instant;

use tracing::debug;

use crate::device::PrecisionManager;
use crate::error::Result;
use crate::estimator::FlowEstimator;
use crate::padder::{pad, unpad, PaddedFrame};
use crate::types::{Frame, FramePair, Multiplier};

pub struct InterpolationEngine<E> {
    estimator: E,
    precision: PrecisionManager,
    calls: u64,
}

impl<E: FlowEstimator> InterpolationEngine<E> {
    pub fn new(estimator: E, precision: PrecisionManager) -> Self {
        Self {
            estimator,
            precision,
            calls: 0,
        }
    }

    pub fn estimator_name(&self) -> &str {
        self.estimator.name()
    }

    pub fn precision(&self) -> &PrecisionManager {
        &self.precision
    }

    /// Total estimator invocations since construction.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn into_estimator(self) -> E {
        self.estimator
    }

    /// The `multiplier - 1` frames strictly between `pair.first()` and `pair.second()`.
    pub fn interpolate(&mut self, pair: &FramePair<'_>, multiplier: Multiplier) -> Result<Vec<Frame>> {
        let started = Instant::now();
        let calls_before = self.calls;
        let mut out = Vec::with_capacity(multiplier.synthesized_per_pair() as usize);
        self.synthesize(pair.first(), pair.second(), multiplier.exponent(), &mut out)?;

        debug!(
            estimator = self.estimator.name(),
            frames = out.len(),
            calls = self.calls - calls_before,
            pair_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Interpolated pair"
        );
        Ok(out)
    }

    fn synthesize(&mut self, a: &Frame, b: &Frame, exponent: u32, out: &mut Vec<Frame>) -> Result<()> {
        if exponent == 0 {
            return Ok(());
        }
        let mid = self.midpoint(a, b)?;
        self.synthesize(a, &mid, exponent - 1, out)?;
        // The right half is built into a separate buffer because `mid` must be
        // pushed between the two halves and is still borrowed here.
        let mut right = Vec::new();
        self.synthesize(&mid, b, exponent - 1, &mut right)?;
        out.push(mid);
        out.append(&mut right);
        Ok(())
    }

    fn midpoint(&mut self, a: &Frame, b: &Frame) -> Result<Frame> {
        FramePair::new(a, b)?;
        let padded_a = pad(a)?;
        let padded_b = pad(b)?;

        let tensor_a = self.precision.to_device_and_precision(&padded_a);
        let tensor_b = self.precision.to_device_and_precision(&padded_b);
        self.calls += 1;
        let estimate = self.estimator.midpoint(&tensor_a, &tensor_b)?;

        let (width, height) = padded_a.original_dimensions();
        let estimate = PaddedFrame::from_estimate(self.precision.to_frame(&estimate)?, width, height)?;
        unpad(&estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ComputeDevice, DeviceSelection, ModelTensor, PrecisionProfile};
    use crate::error::{ErrorKind, SlowmoError};
    use crate::estimator::BlendEstimator;

    fn cpu() -> PrecisionManager {
        PrecisionManager::new(DeviceSelection::cpu())
    }

    fn gray(level: u8) -> Frame {
        Frame::filled(40, 20, [level, level, level]).unwrap()
    }

    #[test]
    fn produces_multiplier_minus_one_frames() {
        let a = gray(0);
        let b = gray(255);
        let pair = FramePair::new(&a, &b).unwrap();
        for m in [2, 4, 8, 16] {
            let mut engine = InterpolationEngine::new(BlendEstimator, cpu());
            let frames = engine.interpolate(&pair, Multiplier::new(m).unwrap()).unwrap();
            assert_eq!(frames.len(), (m - 1) as usize);
            assert_eq!(engine.calls(), (m - 1) as u64);
            assert!(frames.iter().all(|f| f.dimensions() == (40, 20)));
        }
    }

    #[test]
    fn blend_positions_are_k_over_m() {
        // 0 and 240 keep every blend level an exact integer for m = 8 (step 30).
        let a = gray(0);
        let b = gray(240);
        let pair = FramePair::new(&a, &b).unwrap();
        let mut engine = InterpolationEngine::new(BlendEstimator, cpu());
        let frames = engine.interpolate(&pair, Multiplier::new(8).unwrap()).unwrap();
        let levels: Vec<u8> = frames.iter().map(|f| f.pixel(0, 0).unwrap()[0]).collect();
        assert_eq!(levels, vec![30, 60, 90, 120, 150, 180, 210]);
    }

    #[test]
    fn estimator_sees_padded_aligned_tensors() {
        let a = gray(10);
        let b = gray(20);
        let pair = FramePair::new(&a, &b).unwrap();
        let mut seen = Vec::new();
        let estimator = |x: &ModelTensor, y: &ModelTensor| -> Result<ModelTensor> {
            seen.push(x.dims());
            x.average(y)
        };
        let mut engine = InterpolationEngine::new(estimator, cpu());
        engine.interpolate(&pair, Multiplier::new(2).unwrap()).unwrap();
        drop(engine);
        assert_eq!(seen, vec![(1, 3, 32, 64)]);
    }

    #[test]
    fn half_precision_profile_reaches_estimator() {
        let selection = DeviceSelection {
            device: ComputeDevice::Cuda,
            profile: PrecisionProfile::HalfGpu,
        };
        let a = gray(0);
        let b = gray(128);
        let pair = FramePair::new(&a, &b).unwrap();
        let estimator = |x: &ModelTensor, y: &ModelTensor| -> Result<ModelTensor> {
            assert!(x.is_half() && y.is_half());
            x.average(y)
        };
        let mut engine = InterpolationEngine::new(estimator, PrecisionManager::new(selection));
        let frames = engine.interpolate(&pair, Multiplier::new(2).unwrap()).unwrap();
        assert_eq!(frames[0].pixel(5, 5).unwrap(), [64, 64, 64]);
    }

    #[test]
    fn estimator_failure_propagates() {
        let a = gray(0);
        let b = gray(255);
        let pair = FramePair::new(&a, &b).unwrap();
        let failing = |_: &ModelTensor, _: &ModelTensor| -> Result<ModelTensor> {
            Err(SlowmoError::inference("device lost"))
        };
        let mut engine = InterpolationEngine::new(failing, cpu());
        let err = engine.interpolate(&pair, Multiplier::new(4).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn wrong_sized_estimate_is_a_shape_mismatch() {
        let a = gray(0);
        let b = gray(255);
        let pair = FramePair::new(&a, &b).unwrap();
        let shrinking = |_: &ModelTensor, _: &ModelTensor| -> Result<ModelTensor> {
            Ok(ModelTensor::Full(ndarray::Array4::zeros((1, 3, 32, 32))))
        };
        let mut engine = InterpolationEngine::new(shrinking, cpu());
        let err = engine.interpolate(&pair, Multiplier::new(2).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn identical_frames_are_not_special_cased() {
        let a = gray(77);
        let pair = FramePair::new(&a, &a).unwrap();
        let mut engine = InterpolationEngine::new(BlendEstimator, cpu());
        let frames = engine.interpolate(&pair, Multiplier::new(4).unwrap()).unwrap();
        assert_eq!(engine.calls(), 3);
        assert!(frames.iter().all(|f| f == &a));
    }
}
