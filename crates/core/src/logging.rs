use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_decode_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "slowmo";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

const FFMPEG_STDERR_TARGETS: [&str; 2] = ["ffmpeg_decode_stderr", "ffmpeg_encode_stderr"];

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

/// A ready rolling appender, or the reason the run continues console-only.
#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct PanicArtifactRecord {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    source_location: String,
    payload: String,
    backtrace_policy: String,
    backtrace_text: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Write a crash artifact under `<data_dir>/logs/crash` on panic, then defer
/// to the previous hook. Idempotent.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let crash_dir_for_hook = crash_dir.clone();
    panic::set_hook(Box::new(move |panic_info| {
        write_panic_artifact_with_fallback(&crash_dir_for_hook, panic_info);
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. The noise filter applies only when the user gave no explicit
/// filter or verbosity; the file sink keeps ffmpeg stderr at debug.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;
    let noise = options.noise_filter.trim();
    if !implicit || noise.is_empty() {
        return LoggingFilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    LoggingFilterPlan {
        console_filter: format!("{noise},{user_filter}"),
        file_filter: format!("{},{user_filter}", file_noise_filter(noise)),
        user_filter,
    }
}

fn file_noise_filter(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            let target = directive.split_once('=').map_or(*directive, |(t, _)| t.trim());
            !FFMPEG_STDERR_TARGETS.contains(&target)
        })
        .map(str::to_string)
        .collect();
    directives.extend(FFMPEG_STDERR_TARGETS.iter().map(|t| format!("{t}=debug")));
    directives.join(",")
}

fn write_panic_artifact_with_fallback(crash_dir: &Path, panic_info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let write_result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let report = build_panic_artifact_record(panic_info);
        write_panic_artifact_file(crash_dir, &report)
    }));

    match write_result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn build_panic_artifact_record(panic_info: &PanicHookInfo<'_>) -> PanicArtifactRecord {
    let backtrace = Backtrace::capture();
    let (backtrace_policy, backtrace_text) = match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
            "<disabled>".to_string(),
        ),
        _ => ("unsupported".to_string(), "<unavailable>".to_string()),
    };

    PanicArtifactRecord {
        timestamp: chrono::Utc::now(),
        thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
        source_location: panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string()),
        payload: panic_payload_to_string(panic_info.payload()),
        backtrace_policy,
        backtrace_text,
    }
}

fn write_panic_artifact_file(
    crash_dir: &Path,
    report: &PanicArtifactRecord,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let artifact_path = crash_dir.join(format!(
        "{DEFAULT_LOG_FILE_PREFIX}-panic-{}-{sequence:04}.log",
        report.timestamp.format("%Y%m%d-%H%M%S")
    ));

    let mut file = fs::File::create(&artifact_path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.source_location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:\n{}", report.backtrace_text)?;
    file.flush()?;

    Ok(artifact_path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("slowmo_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "slowmo_core=trace");
        assert_eq!(filters.console_filter, "slowmo_core=trace");
        assert_eq!(filters.file_filter, "slowmo_core=trace");
    }

    #[test]
    fn verbosity_beats_rust_log() {
        let options = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        assert_eq!(compose_logging_filters(&options).console_filter, "debug");

        let options = LoggingInitOptions {
            verbose: 3,
            ..Default::default()
        };
        assert_eq!(compose_logging_filters(&options).user_filter, "trace");
    }

    #[test]
    fn implicit_filter_adds_noise_and_keeps_ffmpeg_in_file() {
        let options = LoggingInitOptions {
            rust_log_env: Some("slowmo_core=debug".to_string()),
            ..Default::default()
        };
        let filters = compose_logging_filters(&options);
        assert_eq!(
            filters.console_filter,
            format!("{DEFAULT_NOISE_FILTER},slowmo_core=debug")
        );
        assert_eq!(
            filters.file_filter,
            "ort=error,ffmpeg_decode_stderr=debug,ffmpeg_encode_stderr=debug,slowmo_core=debug"
        );
    }

    #[test]
    fn empty_noise_filter_is_skipped() {
        let options = LoggingInitOptions {
            noise_filter: "  ".to_string(),
            ..Default::default()
        };
        let filters = compose_logging_filters(&options);
        assert_eq!(filters.console_filter, DEFAULT_LOG_FILTER);
        assert_eq!(filters.file_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn file_sink_without_data_dir_falls_back() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert_eq!(plan.log_dir(), None);
    }

    #[test]
    fn file_sink_creates_log_dir() {
        let temp = tempdir().unwrap();
        let options = LoggingInitOptions {
            data_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let plan = build_file_sink_plan(&options);
        assert!(plan.is_ready());
        let expected = temp.path().join(DEFAULT_LOG_DIR_NAME);
        assert_eq!(plan.log_dir(), Some(expected.as_path()));
        assert!(expected.is_dir());
    }

    #[test]
    fn file_sink_falls_back_when_data_dir_is_a_file() {
        let temp = tempdir().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let options = LoggingInitOptions {
            data_dir: Some(blocker.clone()),
            ..Default::default()
        };
        let plan = build_file_sink_plan(&options);
        assert!(!plan.is_ready());
        assert_eq!(
            plan.log_dir(),
            Some(blocker.join(DEFAULT_LOG_DIR_NAME).as_path())
        );
    }

    #[test]
    fn panic_hook_without_data_dir_is_skipped() {
        match install_panic_hook(None) {
            PanicHookInstallPlan::Fallback { reason, .. } => {
                assert!(reason.contains("data_dir"));
            }
            PanicHookInstallPlan::AlreadyInstalled { .. } => {}
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn panic_artifact_file_has_fields() {
        let temp = tempdir().unwrap();
        let record = PanicArtifactRecord {
            timestamp: chrono::Utc::now(),
            thread_name: "worker".to_string(),
            source_location: "src/engine.rs:1:1".to_string(),
            payload: "boom".to_string(),
            backtrace_policy: "disabled".to_string(),
            backtrace_text: "<disabled>".to_string(),
        };
        let path = write_panic_artifact_file(temp.path(), &record).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("slowmo-panic-"));
        let body = fs::read_to_string(path).unwrap();
        assert!(body.contains("thread=worker"));
        assert!(body.contains("payload=boom"));
        assert!(body.contains("location=src/engine.rs:1:1"));
    }

    #[test]
    fn payload_formatting() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "<non-string panic payload>");
    }
}
