use std::path::Path;

use slowmo_core::config::RunConfig;
use slowmo_core::device::{DeviceSelection, PrecisionManager};
use slowmo_core::estimator::BlendEstimator;
use slowmo_core::media::{probe_video, EncoderSettings, FfmpegMedia};
use slowmo_core::runtime::command_for;
use slowmo_core::{ErrorKind, InterpolationEngine, StreamingController};
use tempfile::tempdir;

fn write_test_clip(path: &Path, frames: u32) {
    let status = command_for("ffmpeg")
        .args(["-v", "error", "-y", "-f", "lavfi", "-i"])
        .arg("testsrc=size=64x48:rate=10")
        .args(["-frames:v", &frames.to_string(), "-c:v", "libx264", "-pix_fmt", "yuv420p"])
        .arg(path)
        .status()
        .expect("launch ffmpeg");
    assert!(status.success(), "ffmpeg failed to generate the test clip");
}

fn lossless() -> EncoderSettings {
    EncoderSettings {
        codec: "libx264".into(),
        crf: 0,
        pixel_format: "yuv444p".into(),
        preset: Some("ultrafast".into()),
    }
}

#[test]
#[ignore = "requires ffmpeg and ffprobe"]
fn blend_run_writes_expected_frame_count() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("clip.mp4");
    let output = temp.path().join("out/slow.mkv");
    write_test_clip(&source, 6);

    let config = RunConfig::new(4, &source, &output).unwrap();
    let engine =
        InterpolationEngine::new(BlendEstimator, PrecisionManager::new(DeviceSelection::cpu()));
    let summary = StreamingController::new(config, FfmpegMedia::new(lossless()), engine)
        .run()
        .unwrap();

    assert_eq!(summary.input_frames, 6);
    assert_eq!(summary.output_frames, 21);

    let info = probe_video(&output).unwrap();
    assert_eq!((info.width, info.height), (64, 48));
    assert!((info.fps - 10.0).abs() < 1e-6);
}

#[test]
#[ignore = "requires ffmpeg and ffprobe"]
fn non_video_source_is_a_configuration_error() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("notes.txt");
    std::fs::write(&source, b"not a video").unwrap();

    let config = RunConfig::new(2, &source, temp.path().join("out.mp4")).unwrap();
    let engine =
        InterpolationEngine::new(BlendEstimator, PrecisionManager::new(DeviceSelection::cpu()));
    let err = StreamingController::new(config, FfmpegMedia::default(), engine)
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!temp.path().join("out.mp4").exists());
}
