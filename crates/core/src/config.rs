use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::{DevicePreference, PrecisionPreference};
use crate::error::SlowmoError;
use crate::media::EncoderSettings;
use crate::types::Multiplier;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SLOWMO_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub interpolation: InterpolationConfig,
    pub encoder: EncoderSettings,
    pub preview: PreviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub model_path: PathBuf,
    pub preview_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameRateModeKind {
    #[default]
    Preserve,
    Multiply,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpolationConfig {
    pub multiplier: u32,
    pub frame_rate_mode: FrameRateModeKind,
    /// Only read when `frame_rate_mode = "fixed"`.
    pub output_fps: Option<f64>,
    pub ensemble: bool,
    pub device: DevicePreference,
    pub precision: PrecisionPreference,
    pub use_iobinding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreviewConfig {
    /// Number of leading output frames saved as PNG. 0 disables previews.
    pub frame_count: u32,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/rife.onnx"),
            preview_dir: PathBuf::from("preview"),
        }
    }
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            multiplier: 2,
            frame_rate_mode: FrameRateModeKind::Preserve,
            output_fps: None,
            ensemble: false,
            device: DevicePreference::Auto,
            precision: PrecisionPreference::Auto,
            use_iobinding: false,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self { frame_count: 0 }
    }
}

impl InterpolationConfig {
    pub fn frame_rate_mode(&self) -> crate::error::Result<FrameRateMode> {
        FrameRateMode::from_parts(self.frame_rate_mode, self.output_fps)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SLOWMO_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
/// An existing config file is never rewritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// How the output frame rate relates to the source frame rate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum FrameRateMode {
    /// Output fps equals source fps; playback is `multiplier` times longer.
    #[default]
    Preserve,
    /// Output fps is source fps times the multiplier; duration is unchanged.
    Multiply,
    Fixed(f64),
}

impl FrameRateMode {
    pub fn from_parts(
        kind: FrameRateModeKind,
        output_fps: Option<f64>,
    ) -> crate::error::Result<Self> {
        match (kind, output_fps) {
            (FrameRateModeKind::Preserve, _) => Ok(Self::Preserve),
            (FrameRateModeKind::Multiply, _) => Ok(Self::Multiply),
            (FrameRateModeKind::Fixed, Some(fps)) => Ok(Self::Fixed(fps)),
            (FrameRateModeKind::Fixed, None) => Err(SlowmoError::configuration(
                "frame_rate_mode = \"fixed\" requires output_fps",
            )),
        }
    }

    pub fn output_fps(self, input_fps: f64, multiplier: Multiplier) -> f64 {
        match self {
            Self::Preserve => input_fps,
            Self::Multiply => input_fps * f64::from(multiplier.get()),
            Self::Fixed(fps) => fps,
        }
    }
}

/// Everything one slow-motion run consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub multiplier: Multiplier,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub frame_rate_mode: FrameRateMode,
}

impl RunConfig {
    pub fn new(
        multiplier: u32,
        source_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            multiplier: Multiplier::new(multiplier)?,
            source_path: source_path.into(),
            output_path: output_path.into(),
            frame_rate_mode: FrameRateMode::default(),
        })
    }

    pub fn with_frame_rate_mode(mut self, mode: FrameRateMode) -> Self {
        self.frame_rate_mode = mode;
        self
    }

    /// Checks that need no I/O. Source existence is checked when it is opened.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.source_path.as_os_str().is_empty() {
            return Err(SlowmoError::configuration("source path is empty"));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(SlowmoError::configuration("output path is empty"));
        }
        if same_file(&self.source_path, &self.output_path) {
            return Err(SlowmoError::configuration(format!(
                "output path must differ from the source: {}",
                self.output_path.display()
            )));
        }
        if let FrameRateMode::Fixed(fps) = self.frame_rate_mode {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(SlowmoError::configuration(format!(
                    "output frame rate must be positive, got {fps}"
                )));
            }
        }
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
