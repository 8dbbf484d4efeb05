//! FFmpeg encode subprocess fed raw RGB24 frames over stdin.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::{FrameSink, SinkSpec};
use crate::error::{Result, SlowmoError};
use crate::types::{byte_len, Frame};

/// Codec settings persisted in the `[encoder]` config section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderSettings {
    /// Video codec (e.g. "libx264", "libx265", "hevc_nvenc").
    pub codec: String,
    /// Constant Rate Factor for software encoders, CQ for NVENC.
    pub crf: u32,
    pub pixel_format: String,
    pub preset: Option<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            preset: Some("medium".to_string()),
        }
    }
}

impl EncoderSettings {
    pub fn build_ffmpeg_args(&self, spec: &SinkSpec) -> Vec<String> {
        let size = format!("{}x{}", spec.width, spec.height);
        let is_nvenc = self.codec.contains("nvenc");

        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            size,
            "-r".into(),
            format_fps(spec.frame_rate),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
        ];

        if is_nvenc {
            args.extend([
                "-rc".into(),
                "vbr".into(),
                "-cq".into(),
                self.crf.to_string(),
                "-b:v".into(),
                "0".into(),
            ]);
            args.extend(["-preset".into(), self.preset.clone().unwrap_or_else(|| "p4".into())]);
        } else {
            args.extend(["-crf".into(), self.crf.to_string()]);
            if let Some(ref preset) = self.preset {
                args.extend(["-preset".into(), preset.clone()]);
            }
        }

        args.extend(["-pix_fmt".into(), self.pixel_format.clone()]);
        args.push(spec.path.to_string_lossy().into_owned());
        args
    }
}

fn format_fps(fps: f64) -> String {
    let formatted = format!("{fps:.6}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Kills FFmpeg on [`Drop`] if [`FrameSink::close`] was never reached.
pub struct FfmpegSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    frames_written: u64,
    output_path: PathBuf,
}

impl FfmpegSink {
    pub fn spawn(spec: &SinkSpec, settings: &EncoderSettings) -> Result<Self> {
        let args = settings.build_ffmpeg_args(spec);
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching FFmpeg encoder");

        if let Some(parent) = spec.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SlowmoError::encode(format!(
                    "failed to create output directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SlowmoError::encode(format!("failed to launch ffmpeg (is it installed?): {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SlowmoError::encode("failed to open ffmpeg stdin"))?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_encode_stderr", "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        debug!(
            width = spec.width,
            height = spec.height,
            fps = spec.frame_rate,
            codec = %settings.codec,
            crf = settings.crf,
            pix_fmt = %settings.pixel_format,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stderr_thread,
            frame_size: byte_len(spec.width, spec.height),
            frames_written: 0,
            output_path: spec.path.clone(),
        })
    }
}

impl FrameSink for FfmpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let data = frame.data();
        if data.len() != self.frame_size {
            return Err(SlowmoError::encode(format!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SlowmoError::encode("encoder stdin already closed"))?;

        stdin.write_all(data).map_err(|e| {
            SlowmoError::encode(format!(
                "failed to write frame {} to ffmpeg: {e}",
                self.frames_written
            ))
        })?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = child
            .wait()
            .map_err(|e| SlowmoError::encode(format!("failed to wait for ffmpeg: {e}")))?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            return Err(SlowmoError::encode(format!(
                "ffmpeg encoder exited with status {status}"
            )));
        }

        debug!(
            frames = self.frames_written,
            path = %self.output_path.display(),
            "FFmpeg encoder finished successfully"
        );
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            warn!(path = %self.output_path.display(), "FFmpeg encoder dropped before close; killing");
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
