//! In-memory media backend shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use slowmo_core::config::RunConfig;
use slowmo_core::controller::{FrameSink, FrameSource, MediaIo, SinkSpec};
use slowmo_core::device::{DeviceSelection, PrecisionManager};
use slowmo_core::engine::InterpolationEngine;
use slowmo_core::estimator::FlowEstimator;
use slowmo_core::{Frame, Result, SlowmoError, StreamingController};

pub const WIDTH: u32 = 12;
pub const HEIGHT: u32 = 10;
pub const FPS: f64 = 30.0;

#[derive(Debug, Default)]
pub struct MediaLog {
    pub written: Vec<Frame>,
    pub sink_spec: Option<SinkSpec>,
    pub source_opened: bool,
    pub source_closed: bool,
    pub sink_closed: bool,
    pub writes_after_close: usize,
    pub writes_after_failure: usize,
}

pub struct MemoryMedia {
    frames: Vec<Frame>,
    decode_error_at: Option<usize>,
    source_close_error: bool,
    write_error_at: Option<usize>,
    sink_close_error: bool,
    pub log: Arc<Mutex<MediaLog>>,
}

pub struct MemorySource {
    frames: std::vec::IntoIter<Frame>,
    next_index: usize,
    decode_error_at: Option<usize>,
    close_error: bool,
    log: Arc<Mutex<MediaLog>>,
}

pub struct MemorySink {
    write_error_at: Option<usize>,
    close_error: bool,
    failed: bool,
    log: Arc<Mutex<MediaLog>>,
}

impl MemoryMedia {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            decode_error_at: None,
            source_close_error: false,
            write_error_at: None,
            sink_close_error: false,
            log: Arc::new(Mutex::new(MediaLog::default())),
        }
    }

    /// Fail reading the frame at `index` (0-based) with a decode error.
    pub fn with_decode_error_at(mut self, index: usize) -> Self {
        self.decode_error_at = Some(index);
        self
    }

    /// Every frame decodes, but closing reports a decoder that exited non-zero.
    pub fn with_source_close_error(mut self) -> Self {
        self.source_close_error = true;
        self
    }

    /// Fail writing the output frame at `index` (0-based) with an encode error.
    pub fn with_write_error_at(mut self, index: usize) -> Self {
        self.write_error_at = Some(index);
        self
    }

    /// Writes succeed, but the final flush on close fails.
    pub fn with_sink_close_error(mut self) -> Self {
        self.sink_close_error = true;
        self
    }
}

impl MediaIo for MemoryMedia {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn open_source(&mut self, _path: &Path) -> Result<MemorySource> {
        self.log.lock().unwrap().source_opened = true;
        Ok(MemorySource {
            frames: self.frames.clone().into_iter(),
            next_index: 0,
            decode_error_at: self.decode_error_at,
            close_error: self.source_close_error,
            log: Arc::clone(&self.log),
        })
    }

    fn open_sink(&mut self, spec: &SinkSpec) -> Result<MemorySink> {
        self.log.lock().unwrap().sink_spec = Some(spec.clone());
        Ok(MemorySink {
            write_error_at: self.write_error_at,
            close_error: self.sink_close_error,
            failed: false,
            log: Arc::clone(&self.log),
        })
    }
}

impl FrameSource for MemorySource {
    fn read_next(&mut self) -> Result<Option<Frame>> {
        if self.decode_error_at == Some(self.next_index) {
            return Err(SlowmoError::decode(format!("corrupt packet at frame {}", self.next_index)));
        }
        self.next_index += 1;
        Ok(self.frames.next())
    }

    fn dimensions(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }

    fn frame_rate(&self) -> f64 {
        FPS
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().source_closed = true;
        if self.close_error {
            return Err(SlowmoError::decode("ffmpeg decoder exited with status 1"));
        }
        Ok(())
    }
}

impl FrameSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.sink_closed {
            log.writes_after_close += 1;
        }
        if self.failed {
            log.writes_after_failure += 1;
        }
        if self.write_error_at == Some(log.written.len()) {
            self.failed = true;
            return Err(SlowmoError::encode(format!(
                "broken pipe writing frame {}",
                log.written.len()
            )));
        }
        log.written.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().sink_closed = true;
        if self.close_error {
            return Err(SlowmoError::encode("ffmpeg encoder exited with status 1"));
        }
        Ok(())
    }
}

/// Uniform gray frames at the given levels.
pub fn gray_frames(levels: &[u8]) -> Vec<Frame> {
    levels
        .iter()
        .map(|&v| Frame::filled(WIDTH, HEIGHT, [v, v, v]).unwrap())
        .collect()
}

pub fn run_config(multiplier: u32) -> RunConfig {
    RunConfig::new(
        multiplier,
        PathBuf::from("memory://source"),
        PathBuf::from("memory://output"),
    )
    .unwrap()
}

pub fn controller<E: FlowEstimator>(
    media: MemoryMedia,
    estimator: E,
    multiplier: u32,
) -> StreamingController<MemoryMedia, E> {
    let engine = InterpolationEngine::new(estimator, PrecisionManager::new(DeviceSelection::cpu()));
    StreamingController::new(run_config(multiplier), media, engine)
}
