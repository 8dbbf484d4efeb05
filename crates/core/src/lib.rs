//! Streaming slow-motion interpolation: decode, synthesize in-between frames
//! with a flow estimator, and encode, one frame pair at a time.

pub mod config;
pub mod controller;
pub mod device;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod media;
pub mod padder;
pub mod preview;
pub mod runtime;
pub mod types;

pub use controller::{FrameSink, FrameSource, MediaIo, StreamingController};
pub use engine::InterpolationEngine;
pub use error::{ErrorKind, Result, SlowmoError};
pub use types::{Frame, FramePair, Multiplier};
