//! PNG snapshots of the first frames written to the sink.
//!
//! Previews are a convenience for eyeballing model quality before a long run
//! finishes. A failed snapshot is logged and never fails the run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbImage;
use tracing::{debug, warn};

use crate::types::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Original,
    Interpolated,
}

impl FrameOrigin {
    fn label(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Interpolated => "interpolated",
        }
    }
}

pub struct PreviewWriter {
    dir: PathBuf,
    limit: u32,
    written: u32,
}

impl PreviewWriter {
    pub fn new(dir: impl Into<PathBuf>, limit: u32) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create preview directory {}", dir.display()))?;
        Ok(Self {
            dir,
            limit,
            written: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> u32 {
        self.written
    }

    pub fn is_full(&self) -> bool {
        self.written >= self.limit
    }

    /// Save `frame` if the limit has not been reached yet.
    ///
    /// `position` is the frame's place within its source interval:
    /// `k / m` for the k-th synthesized frame, 1.0 for an original that ends
    /// an interval and 0.0 only for the very first frame.
    pub fn record(&mut self, output_index: u64, position: f64, origin: FrameOrigin, frame: &Frame) {
        if self.is_full() {
            return;
        }
        let path = self.dir.join(preview_file_name(output_index, position, origin));
        match save_png(&path, frame) {
            Ok(()) => {
                self.written += 1;
                debug!(path = %path.display(), "Saved preview frame");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{e:#}"), "Failed to save preview frame");
            }
        }
    }
}

pub fn preview_file_name(output_index: u64, position: f64, origin: FrameOrigin) -> String {
    format!(
        "idx{output_index:04}_time{position:.3}_{}.png",
        origin.label()
    )
}

fn save_png(path: &Path, frame: &Frame) -> Result<()> {
    let image = RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
        .context("frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
