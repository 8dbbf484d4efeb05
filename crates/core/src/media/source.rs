//! FFmpeg decode subprocess producing RGB24 frames on stdout.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::probe::VideoStreamInfo;
use crate::controller::FrameSource;
use crate::error::{Result, SlowmoError};
use crate::types::{byte_len, Frame};

pub struct FfmpegSource {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
    info: VideoStreamInfo,
    frame_size: usize,
    frames_read: u64,
    done: bool,
}

fn build_decoder_args(path: &Path, stream_index: usize) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-vsync".to_string(),
        "passthrough".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

impl FfmpegSource {
    pub fn spawn(path: &Path, info: VideoStreamInfo) -> Result<Self> {
        let args = build_decoder_args(path, info.stream_index);
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching FFmpeg decoder");

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SlowmoError::configuration(format!("failed to launch ffmpeg (is it installed?): {e}"))
            })?;

        let stdout = child.stdout.take();
        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_decode_stderr", "{}", line);
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_decode_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        Ok(Self {
            child: Some(child),
            stdout,
            stderr_thread,
            frame_size: byte_len(info.width, info.height),
            info,
            frames_read: 0,
            done: false,
        })
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.stdout.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = if self.done {
            child.wait()
        } else {
            // Stopped early (cancel or failure); ffmpeg would block on a full pipe.
            let _ = child.kill();
            child.wait()
        }
        .map_err(|e| SlowmoError::decode(format!("failed to wait for ffmpeg: {e}")))?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if self.done && !status.success() {
            return Err(SlowmoError::decode(format!(
                "ffmpeg decoder exited with status {status}"
            )));
        }
        Ok(())
    }
}

impl FrameSource for FfmpegSource {
    fn read_next(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| SlowmoError::decode("ffmpeg stdout not available"))?;

        let mut buf = vec![0u8; self.frame_size];
        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut buf[total_read..]) {
                Ok(0) => {
                    self.done = true;
                    if total_read == 0 {
                        return Ok(None);
                    }
                    return Err(SlowmoError::decode(format!(
                        "truncated frame {} at end of stream ({total_read}/{} bytes)",
                        self.frames_read, self.frame_size
                    )));
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Err(SlowmoError::decode(format!(
                        "failed to read frame {} from ffmpeg: {e}",
                        self.frames_read
                    )));
                }
            }
        }

        self.frames_read += 1;
        Frame::new(self.info.width, self.info.height, buf).map(Some)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    fn frame_rate(&self) -> f64 {
        self.info.fps
    }

    fn frame_count(&self) -> Option<u64> {
        self.info.frame_count
    }

    fn close(&mut self) -> Result<()> {
        let result = self.finish();
        debug!(frames = self.frames_read, "FFmpeg decoder closed");
        result
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        drop(self.stdout.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_thread.take() {
            if handle.join().is_err() {
                warn!("ffmpeg decoder stderr thread panicked");
            }
        }
    }
}
