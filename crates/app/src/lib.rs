use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use slowmo_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, FrameRateMode,
    FrameRateModeKind, RunConfig,
};
use slowmo_core::controller::ChannelObserver;
use slowmo_core::device::{
    select_profile, DevicePreference, DeviceSelection, OrtDeviceProbe, PrecisionManager,
    PrecisionPreference,
};
use slowmo_core::estimator::rife::{RifeEstimator, RifeOptions};
use slowmo_core::estimator::{BlendEstimator, FlowEstimator};
use slowmo_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use slowmo_core::media::{EncoderSettings, FfmpegMedia};
use slowmo_core::preview::PreviewWriter;
use slowmo_core::types::{ProgressEvent, RunSummary};
use slowmo_core::{InterpolationEngine, StreamingController};

#[derive(Parser, Debug)]
#[command(
    name = "slowmo",
    version,
    about = "Slow-motion video by synthesizing in-between frames"
)]
struct Cli {
    #[arg(help = "Source video")]
    input: PathBuf,

    #[arg(help = "Output video (container chosen by extension)")]
    output: PathBuf,

    #[arg(
        short = 'm',
        long,
        value_name = "N",
        help = "Frame multiplier, a power of two >= 2 [config: interpolation.multiplier]"
    )]
    multiplier: Option<u32>,

    #[arg(long = "fps-mode", value_enum, help = "Output frame rate policy")]
    fps_mode: Option<FpsModeArg>,

    #[arg(
        long = "output-fps",
        value_name = "FPS",
        help = "Explicit output frame rate (implies --fps-mode fixed)"
    )]
    output_fps: Option<f64>,

    #[arg(long, value_enum, default_value_t = EstimatorKind::Rife)]
    estimator: EstimatorKind,

    #[arg(long, value_name = "PATH", help = "RIFE ONNX model [config: paths.model_path]")]
    model: Option<PathBuf>,

    #[arg(long, value_parser = parse_device, help = "auto, cpu, cuda or coreml")]
    device: Option<DevicePreference>,

    #[arg(long, value_parser = parse_precision, help = "auto, full or half")]
    precision: Option<PrecisionPreference>,

    #[arg(long, help = "Average with a horizontally mirrored pass")]
    ensemble: bool,

    #[arg(long, help = "Use ONNX Runtime IO binding")]
    iobinding: bool,

    #[arg(long, value_name = "N", help = "Save the first N output frames as PNG")]
    preview: Option<u32>,

    #[arg(long, help = "Video codec passed to ffmpeg [config: encoder.codec]")]
    codec: Option<String>,

    #[arg(long, help = "Encoder quality [config: encoder.crf]")]
    crf: Option<u32>,

    #[arg(long = "summary-json", help = "Print the run summary as JSON on stdout")]
    summary_json: bool,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FpsModeArg {
    Preserve,
    Multiply,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EstimatorKind {
    /// RIFE ONNX model
    Rife,
    /// Cross-fade, no model needed
    Blend,
}

fn parse_device(value: &str) -> std::result::Result<DevicePreference, String> {
    DevicePreference::parse(value).map_err(|e| e.to_string())
}

fn parse_precision(value: &str) -> std::result::Result<PrecisionPreference, String> {
    PrecisionPreference::parse(value).map_err(|e| e.to_string())
}

/// Everything needed to start a run: config file values with CLI overrides applied.
#[derive(Debug, Clone)]
struct ResolvedRun {
    run: RunConfig,
    estimator: EstimatorKind,
    rife: RifeOptions,
    device: DevicePreference,
    precision: PrecisionPreference,
    encoder: EncoderSettings,
    preview: Option<(PathBuf, u32)>,
}

fn resolve_run(cli: &Cli, config: &AppConfig, data_dir: &Path) -> Result<ResolvedRun> {
    let interp = &config.interpolation;

    let mode_kind = match (cli.fps_mode, cli.output_fps) {
        (Some(FpsModeArg::Preserve), _) => FrameRateModeKind::Preserve,
        (Some(FpsModeArg::Multiply), _) => FrameRateModeKind::Multiply,
        (Some(FpsModeArg::Fixed), _) | (None, Some(_)) => FrameRateModeKind::Fixed,
        (None, None) => interp.frame_rate_mode,
    };
    let frame_rate_mode = FrameRateMode::from_parts(mode_kind, cli.output_fps.or(interp.output_fps))?;

    let run = RunConfig::new(
        cli.multiplier.unwrap_or(interp.multiplier),
        cli.input.clone(),
        cli.output.clone(),
    )?
    .with_frame_rate_mode(frame_rate_mode);
    run.validate()?;

    let model_path = match &cli.model {
        Some(path) => path.clone(),
        None => resolve_relative_to(data_dir, &config.paths.model_path),
    };
    let rife = RifeOptions {
        ensemble: cli.ensemble || interp.ensemble,
        use_iobinding: cli.iobinding || interp.use_iobinding,
        ..RifeOptions::new(model_path)
    };

    let mut encoder = config.encoder.clone();
    if let Some(codec) = &cli.codec {
        encoder.codec = codec.clone();
    }
    if let Some(crf) = cli.crf {
        encoder.crf = crf;
    }

    let preview_count = cli.preview.unwrap_or(config.preview.frame_count);
    let preview = (preview_count > 0).then(|| {
        (
            resolve_relative_to(data_dir, &config.paths.preview_dir),
            preview_count,
        )
    });

    Ok(ResolvedRun {
        run,
        estimator: cli.estimator,
        rife,
        device: cli.device.unwrap_or(interp.device),
        precision: cli.precision.unwrap_or(interp.precision),
        encoder,
        preview,
    })
}

fn build_estimator(resolved: &ResolvedRun) -> Result<(Box<dyn FlowEstimator>, DeviceSelection)> {
    match resolved.estimator {
        EstimatorKind::Blend => {
            info!("Using cross-fade estimator; no model is loaded");
            Ok((Box::new(BlendEstimator), DeviceSelection::cpu()))
        }
        EstimatorKind::Rife => {
            let selection = select_profile(&OrtDeviceProbe, resolved.device, resolved.precision)?;
            let estimator = RifeEstimator::load(&resolved.rife, selection)?;
            let selection = selection.reconcile_with_model(estimator.accepts_half());
            Ok((Box::new(estimator), selection))
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_report = slowmo_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    slowmo_core::runtime::log_runtime_lib_status(&runtime_report);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    let cfg_path = config_path(&resolved_data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    let resolved = resolve_run(&cli, &config, &resolved_data_dir)?;
    let summary = run_slowmo(resolved).await?;

    if cli.summary_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("failed to serialize run summary")?
        );
    }
    Ok(())
}

async fn run_slowmo(resolved: ResolvedRun) -> Result<RunSummary> {
    let (estimator, selection) = build_estimator(&resolved)?;
    let engine = InterpolationEngine::new(estimator, PrecisionManager::new(selection));
    let media = FfmpegMedia::new(resolved.encoder.clone());

    let (observer, events) = ChannelObserver::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut controller = StreamingController::new(resolved.run.clone(), media, engine)
        .with_observer(observer)
        .with_cancel(cancel_rx);
    if let Some((dir, count)) = &resolved.preview {
        controller = controller.with_preview(
            PreviewWriter::new(dir, *count).context("failed to prepare preview directory")?,
        );
    }

    let progress = tokio::spawn(print_progress(events));
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            warn!("Interrupt received; finishing the current pair and closing the output");
            let _ = cancel_tx.send(true);
        }
    });

    let (_, result) = controller.run_in_background().await;
    ctrl_c.abort();
    // The observer is dropped with the controller, which ends the progress task.
    let _ = progress.await;
    eprintln!();

    let summary = result?;
    if summary.cancelled {
        warn!(
            output_frames = summary.output_frames,
            "Run cancelled; output contains the frames written so far"
        );
    }
    eprintln!(
        "Wrote {} frames ({} synthesized) at {:.3} fps in {}",
        summary.output_frames,
        summary.interpolated_frames,
        summary.output_fps,
        format_duration(summary.elapsed.as_secs_f64()),
    );
    Ok(summary)
}

async fn print_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = events.recv().await {
        eprint!("\r{}    ", render_progress(&event));
    }
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(event: &ProgressEvent) -> String {
    let rate = event.rate();
    let elapsed = format_duration(event.elapsed.as_secs_f64());

    match (event.fraction(), event.frames_total) {
        (Some(fraction), Some(total)) => {
            let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
            let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
            let bar: String = "█".repeat(filled) + &"░".repeat(empty);
            let eta = if rate > 0.0 {
                let remaining = total.saturating_sub(event.frames_processed) as f64;
                format!(" | ETA: {}", format_duration(remaining / rate))
            } else {
                String::new()
            };
            format!(
                "[{bar}] {:5.1}% | Pair {}/{total} | {rate:.1} pairs/s | Elapsed: {elapsed}{eta}",
                fraction * 100.0,
                event.frames_processed,
            )
        }
        _ => format!(
            "Pair {} | {rate:.1} pairs/s | Elapsed: {elapsed}",
            event.frames_processed
        ),
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let fallback = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(
                    &init_plan.filters.file_filter,
                    "file",
                ));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            None
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = fallback {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
