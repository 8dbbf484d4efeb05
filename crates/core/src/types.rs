use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, SlowmoError};

/// Number of color channels carried by every frame at the system boundary.
pub const CHANNELS: usize = 3;

/// 8-bit RGB frame, row-major HWC, as decoded from or encoded to FFmpeg rawvideo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SlowmoError::decode(format!(
                "frame dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = byte_len(width, height);
        if data.len() != expected {
            return Err(SlowmoError::decode(format!(
                "frame {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A frame where every pixel has the same color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let pixels = width as usize * height as usize;
        let data = rgb.iter().copied().cycle().take(pixels * CHANNELS).collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// RGB at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let rgb = self.data.get(offset..offset + CHANNELS)?;
        Some([rgb[0], rgb[1], rgb[2]])
    }
}

pub fn byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * CHANNELS
}

/// Two temporally adjacent frames of identical dimensions, `first` preceding `second`.
#[derive(Debug, Clone, Copy)]
pub struct FramePair<'a> {
    first: &'a Frame,
    second: &'a Frame,
}

impl<'a> FramePair<'a> {
    pub fn new(first: &'a Frame, second: &'a Frame) -> Result<Self> {
        if first.dimensions() != second.dimensions() {
            return Err(SlowmoError::ShapeMismatch {
                first_width: first.width,
                first_height: first.height,
                second_width: second.width,
                second_height: second.height,
            });
        }
        Ok(Self { first, second })
    }

    pub fn first(&self) -> &'a Frame {
        self.first
    }

    pub fn second(&self) -> &'a Frame {
        self.second
    }
}

/// Output frames per source interval: one original plus `get() - 1` synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Multiplier(u32);

impl Multiplier {
    pub fn new(value: u32) -> Result<Self> {
        if value < 2 || !value.is_power_of_two() {
            return Err(SlowmoError::configuration(format!(
                "multiplier must be a power of two >= 2, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Recursion depth `n` such that `get() == 2^n`.
    pub fn exponent(self) -> u32 {
        self.0.trailing_zeros()
    }

    pub fn synthesized_per_pair(self) -> u32 {
        self.0 - 1
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self(2)
    }
}

impl TryFrom<u32> for Multiplier {
    type Error = SlowmoError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

/// Emitted once per processed frame pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Pairs fully written to the sink.
    pub frames_processed: u64,
    /// Total pairs in the source, when the container reports a frame count.
    pub frames_total: Option<u64>,
    pub elapsed: Duration,
}

impl ProgressEvent {
    pub fn fraction(&self) -> Option<f64> {
        match self.frames_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.frames_processed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    /// Pairs per second since the run started.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            0.0
        } else {
            self.frames_processed as f64 / secs
        }
    }
}

/// Outcome of a completed (or cancelled) run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub input_frames: u64,
    pub interpolated_frames: u64,
    pub output_frames: u64,
    pub input_fps: f64,
    pub output_fps: f64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub cancelled: bool,
    pub preview_frames: u32,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
