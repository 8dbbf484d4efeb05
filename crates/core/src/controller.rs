//! Streaming controller: decode -> interpolate -> encode with bounded memory.
//!
//! Only the previous source frame and the synthesized frames of the pair in
//! flight are resident at any time. Writes are append-only: each pair emits
//! its first frame followed by the synthesized sequence, and the very last
//! source frame is written once during draining.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::engine::InterpolationEngine;
use crate::error::{Result, SlowmoError};
use crate::estimator::FlowEstimator;
use crate::preview::{FrameOrigin, PreviewWriter};
use crate::types::{Frame, FramePair, ProgressEvent, RunSummary};

/// Sequential frame decoder over an opened container.
pub trait FrameSource: Send {
    /// Next frame in playback order, or `None` at end of stream.
    fn read_next(&mut self) -> Result<Option<Frame>>;
    fn dimensions(&self) -> (u32, u32);
    fn frame_rate(&self) -> f64;
    /// Frame count reported by the container, if any.
    fn frame_count(&self) -> Option<u64> {
        None
    }
    fn close(&mut self) -> Result<()>;
}

/// Append-only frame encoder.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;
    /// Flush everything buffered and release the output.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

/// Opens sources and sinks for a run.
pub trait MediaIo: Send {
    type Source: FrameSource;
    type Sink: FrameSink;

    fn open_source(&mut self, path: &Path) -> Result<Self::Source>;
    fn open_sink(&mut self, spec: &SinkSpec) -> Result<Self::Sink>;
}

/// One-way receiver of progress events. Must not block.
pub trait ProgressObserver: Send {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Forwards events over an unbounded channel so a UI task can consume them
/// at its own pace. A dropped receiver is ignored.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        let _ = self.tx.send(*event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Idle,
    Opened,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl ControllerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Opened => "opened",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    input_frames: u64,
    interpolated_frames: u64,
    output_frames: u64,
    cancelled: bool,
}

pub struct StreamingController<M, E> {
    config: RunConfig,
    media: M,
    engine: InterpolationEngine<E>,
    observer: Box<dyn ProgressObserver>,
    cancel: Option<watch::Receiver<bool>>,
    preview: Option<PreviewWriter>,
    state: watch::Sender<ControllerState>,
}

impl<M, E> StreamingController<M, E>
where
    M: MediaIo,
    E: FlowEstimator,
{
    pub fn new(config: RunConfig, media: M, engine: InterpolationEngine<E>) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        Self {
            config,
            media,
            engine,
            observer: Box::new(NoopObserver),
            cancel: None,
            preview: None,
            state,
        }
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Abort between pairs once the receiver reads `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_preview(mut self, preview: PreviewWriter) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Watch state transitions from another task.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub fn engine(&self) -> &InterpolationEngine<E> {
        &self.engine
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    /// Drive the whole run on the calling thread.
    ///
    /// Source and sink are closed on every exit path. On error the controller
    /// ends in [`ControllerState::Failed`].
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state().is_terminal() {
            return Err(SlowmoError::configuration(format!(
                "controller already finished ({})",
                self.state()
            )));
        }

        let result = self.run_inner();
        if let Err(e) = &result {
            error!(error = %e, kind = %e.kind(), "Slow-motion run failed");
            self.set_state(ControllerState::Failed);
        }
        result
    }

    fn run_inner(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.config.validate()?;

        let mut source = self.media.open_source(&self.config.source_path)?;
        let first = match source.read_next() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                release_source(&mut source);
                return Err(SlowmoError::configuration(format!(
                    "source contains no frames: {}",
                    self.config.source_path.display()
                )));
            }
            Err(e) => {
                release_source(&mut source);
                return Err(e);
            }
        };
        if first.dimensions() != source.dimensions() {
            let (width, height) = source.dimensions();
            release_source(&mut source);
            return Err(SlowmoError::decode(format!(
                "first frame is {}x{} but the source reports {width}x{height}",
                first.width(),
                first.height()
            )));
        }

        let input_fps = source.frame_rate();
        let multiplier = self.config.multiplier;
        let output_fps = self.config.frame_rate_mode.output_fps(input_fps, multiplier);
        let (width, height) = first.dimensions();
        let spec = SinkSpec {
            path: self.config.output_path.clone(),
            width,
            height,
            frame_rate: output_fps,
        };
        let mut sink = match self.media.open_sink(&spec) {
            Ok(sink) => sink,
            Err(e) => {
                release_source(&mut source);
                return Err(e);
            }
        };

        self.set_state(ControllerState::Opened);
        info!(
            source = %self.config.source_path.display(),
            output = %self.config.output_path.display(),
            width,
            height,
            multiplier = multiplier.get(),
            input_fps = format!("{input_fps:.3}"),
            output_fps = format!("{output_fps:.3}"),
            estimator = self.engine.estimator_name(),
            "Opened slow-motion run"
        );

        let counters = match self.stream(&mut source, &mut sink, first, started) {
            Ok(counters) => counters,
            Err(e) => {
                release_sink(&mut sink);
                release_source(&mut source);
                return Err(e);
            }
        };

        if let Err(e) = sink.close() {
            release_source(&mut source);
            return Err(e);
        }
        // A decoder that died mid-stream looks like a clean EOF until its
        // exit status is checked here.
        source.close()?;
        self.set_state(ControllerState::Closed);

        let summary = RunSummary {
            input_frames: counters.input_frames,
            interpolated_frames: counters.interpolated_frames,
            output_frames: counters.output_frames,
            input_fps,
            output_fps,
            elapsed: started.elapsed(),
            cancelled: counters.cancelled,
            preview_frames: self.preview.as_ref().map_or(0, PreviewWriter::written),
        };

        info!(
            input_frames = summary.input_frames,
            interpolated_frames = summary.interpolated_frames,
            output_frames = summary.output_frames,
            estimator_calls = self.engine.calls(),
            cancelled = summary.cancelled,
            elapsed_ms = format!("{:.0}", summary.elapsed.as_secs_f64() * 1000.0),
            "Slow-motion run finished"
        );

        Ok(summary)
    }

    fn stream(
        &mut self,
        source: &mut M::Source,
        sink: &mut M::Sink,
        first: Frame,
        started: Instant,
    ) -> Result<Counters> {
        self.set_state(ControllerState::Streaming);

        let multiplier = self.config.multiplier;
        let frames_total = source.frame_count().map(|n| n.saturating_sub(1));
        let mut counters = Counters {
            input_frames: 1,
            ..Counters::default()
        };
        let mut pairs = 0_u64;
        let mut total_interpolate_ms = 0.0_f64;
        let mut total_write_ms = 0.0_f64;
        let mut previous = first;

        loop {
            if self.cancel_requested() {
                info!(pairs, "Cancellation requested, draining");
                counters.cancelled = true;
                break;
            }

            let Some(current) = source.read_next()? else {
                break;
            };
            counters.input_frames += 1;

            let pair = FramePair::new(&previous, &current)?;
            let t_interp = Instant::now();
            let synthesized = self.engine.interpolate(&pair, multiplier)?;
            total_interpolate_ms += t_interp.elapsed().as_secs_f64() * 1000.0;

            let t_write = Instant::now();
            let opening = original_position(pairs);
            self.emit(sink, &previous, opening, FrameOrigin::Original, &mut counters)?;
            let m = f64::from(multiplier.get());
            for (k, frame) in synthesized.iter().enumerate() {
                let position = (k + 1) as f64 / m;
                self.emit(sink, frame, position, FrameOrigin::Interpolated, &mut counters)?;
                counters.interpolated_frames += 1;
            }
            total_write_ms += t_write.elapsed().as_secs_f64() * 1000.0;

            previous = current;
            pairs += 1;

            self.observer.on_progress(&ProgressEvent {
                frames_processed: pairs,
                frames_total,
                elapsed: started.elapsed(),
            });
        }

        self.set_state(ControllerState::Draining);
        let closing = original_position(pairs);
        self.emit(sink, &previous, closing, FrameOrigin::Original, &mut counters)?;

        if pairs > 0 {
            info!(
                pairs,
                avg_interpolate_ms = format!("{:.1}", total_interpolate_ms / pairs as f64),
                avg_write_ms = format!("{:.1}", total_write_ms / pairs as f64),
                total_interpolate_ms = format!("{total_interpolate_ms:.0}"),
                total_write_ms = format!("{total_write_ms:.0}"),
                "Streaming stage summary"
            );
        }

        Ok(counters)
    }

    fn emit(
        &mut self,
        sink: &mut M::Sink,
        frame: &Frame,
        position: f64,
        origin: FrameOrigin,
        counters: &mut Counters,
    ) -> Result<()> {
        sink.write(frame)?;
        if let Some(preview) = self.preview.as_mut() {
            preview.record(counters.output_frames, position, origin, frame);
        }
        counters.output_frames += 1;
        Ok(())
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn set_state(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Controller state change");
        }
    }
}

impl<M, E> StreamingController<M, E>
where
    M: MediaIo + 'static,
    E: FlowEstimator + 'static,
{
    /// Run on tokio's blocking pool so async callers can await the result
    /// while observing progress.
    ///
    /// The controller is handed back alongside the outcome so its final state
    /// can be inspected.
    pub async fn run_in_background(mut self) -> (Option<Self>, Result<RunSummary>) {
        let handle = tokio::task::spawn_blocking(move || {
            let result = self.run();
            (self, result)
        });
        match handle.await {
            Ok((controller, result)) => (Some(controller), result),
            Err(join_error) => (
                None,
                Err(SlowmoError::Worker(format!(
                    "streaming task panicked or was cancelled: {join_error}"
                ))),
            ),
        }
    }
}

/// Every original after the first closes the interval before it.
fn original_position(pairs_done: u64) -> f64 {
    if pairs_done == 0 {
        0.0
    } else {
        1.0
    }
}

fn release_source<S: FrameSource>(source: &mut S) {
    if let Err(e) = source.close() {
        warn!(error = %e, "Failed to close frame source");
    }
}

fn release_sink<S: FrameSink>(sink: &mut S) {
    if let Err(e) = sink.close() {
        warn!(error = %e, "Failed to close frame sink after error");
    }
}
