//! Flow estimators: the black-box `midpoint(a, b)` capability the engine recurses over.

pub mod rife;
pub mod session;

use crate::device::ModelTensor;
use crate::error::{Result, SlowmoError};

/// Synthesizes the temporal midpoint of two same-sized tensors.
///
/// Calls are blocking and never overlap for one stream. Implementations must
/// return a tensor with the same dimensions as their inputs, fail with
/// [`SlowmoError::ShapeMismatch`] when the inputs differ, and with
/// [`SlowmoError::Inference`] (or `ResourceExhausted`) on device failure.
pub trait FlowEstimator: Send {
    fn name(&self) -> &str {
        "FlowEstimator"
    }

    fn midpoint(&mut self, first: &ModelTensor, second: &ModelTensor) -> Result<ModelTensor>;
}

impl<F> FlowEstimator for F
where
    F: FnMut(&ModelTensor, &ModelTensor) -> Result<ModelTensor> + Send,
{
    fn midpoint(&mut self, first: &ModelTensor, second: &ModelTensor) -> Result<ModelTensor> {
        self(first, second)
    }
}

impl FlowEstimator for Box<dyn FlowEstimator> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn midpoint(&mut self, first: &ModelTensor, second: &ModelTensor) -> Result<ModelTensor> {
        (**self).midpoint(first, second)
    }
}

pub fn ensure_same_shape(first: &ModelTensor, second: &ModelTensor) -> Result<()> {
    let (_, _, h0, w0) = first.dims();
    let (_, _, h1, w1) = second.dims();
    if first.dims() != second.dims() {
        return Err(SlowmoError::ShapeMismatch {
            first_width: w0 as u32,
            first_height: h0 as u32,
            second_width: w1 as u32,
            second_height: h1 as u32,
        });
    }
    Ok(())
}

/// Per-pixel 50/50 cross-fade. No motion compensation.
///
/// Useful as a model-free preview of the pipeline and as a deterministic
/// stand-in wherever a real network is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlendEstimator;

impl FlowEstimator for BlendEstimator {
    fn name(&self) -> &str {
        "Blend"
    }

    fn midpoint(&mut self, first: &ModelTensor, second: &ModelTensor) -> Result<ModelTensor> {
        ensure_same_shape(first, second)?;
        first.average(second)
    }
}
