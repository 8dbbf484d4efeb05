//! FFmpeg-backed frame source and sink.

pub mod probe;
pub mod sink;
pub mod source;

use std::path::Path;

use tracing::info;

pub use probe::VideoStreamInfo;
pub use sink::{EncoderSettings, FfmpegSink};
pub use source::FfmpegSource;

use crate::controller::{MediaIo, SinkSpec};
use crate::error::{Result, SlowmoError};

/// Spawns one ffmpeg decoder and one encoder per run.
#[derive(Debug, Clone, Default)]
pub struct FfmpegMedia {
    encoder: EncoderSettings,
}

impl FfmpegMedia {
    pub fn new(encoder: EncoderSettings) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> &EncoderSettings {
        &self.encoder
    }
}

/// Stream metadata for `path`. Missing or unreadable inputs are configuration
/// errors: nothing has been decoded yet.
pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    if !path.is_file() {
        return Err(SlowmoError::configuration(format!(
            "source video not found: {}",
            path.display()
        )));
    }
    probe::run_ffprobe(path)
        .and_then(|probe| probe::video_stream_info(&probe))
        .map_err(|e| {
            SlowmoError::configuration(format!("cannot probe {}: {e:#}", path.display()))
        })
}

impl MediaIo for FfmpegMedia {
    type Source = FfmpegSource;
    type Sink = FfmpegSink;

    fn open_source(&mut self, path: &Path) -> Result<FfmpegSource> {
        let info = probe_video(path)?;
        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = format!("{:.3}", info.fps),
            codec = %info.codec_name,
            frames = ?info.frame_count,
            "Opened source video"
        );
        FfmpegSource::spawn(path, info)
    }

    fn open_sink(&mut self, spec: &SinkSpec) -> Result<FfmpegSink> {
        FfmpegSink::spawn(spec, &self.encoder)
    }
}
