//! Locating helper binaries (ffmpeg, ffprobe) and the ONNX Runtime shared
//! library before any session is created.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Extra directory searched first for ffmpeg/ffprobe.
pub const BIN_DIR_ENV: &str = "SLOWMO_BIN_DIR";
pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// GPU runtime libraries that must be resident before the CUDA provider loads.
/// Ordered so that dependencies come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GpuLibTier {
    CudaRuntime,
    Cudnn,
}

impl GpuLibTier {
    /// ORT provider libraries are excluded: they need symbols from
    /// `libonnxruntime` which the ort crate loads later.
    #[cfg(unix)]
    fn classify(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if ["libcudart", "libcublaslt", "libcublas", "libcufft", "libcurand"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            Some(Self::CudaRuntime)
        } else if name.starts_with("libcudnn") {
            Some(Self::Cudnn)
        } else {
            None
        }
    }

    #[cfg(windows)]
    fn classify(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if ["cudart64_", "cublas64_", "cublaslt64_"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            Some(Self::CudaRuntime)
        } else if name.starts_with("cudnn64_") {
            Some(Self::Cudnn)
        } else {
            None
        }
    }
}

/// What [`setup_runtime_libs`] found; logged once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub ort_dylib: Option<PathBuf>,
    pub ort_dylib_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then system dirs on unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(BIN_DIR_ENV).filter(|v| !v.is_empty()) {
        push_unique(&mut dirs, PathBuf::from(dir));
    }
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("bin"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

fn binary_file_name(binary: &str) -> String {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn find_in_dirs(file_name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// A [`ProcessCommand`] for `binary`, preferring a bundled copy over `PATH`.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_in_dirs(&binary_file_name(binary), &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

/// Candidate GPU libs in `dirs`, first directory wins per file name, sorted
/// so CUDA runtime libs precede cuDNN.
fn gpu_libs_in_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut libs: Vec<(GpuLibTier, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_shared_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(tier) = GpuLibTier::classify(&name) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort();
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn is_shared_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Loads the library globally and leaks the handle so it stays resident.
#[cfg(unix)]
fn load_library(path: &Path) -> bool {
    // SAFETY: the library is a vendor CUDA runtime with no init-time
    // requirements beyond being loaded before its dependents.
    match unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn load_library(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Resolve `ORT_DYLIB_PATH` and preload CUDA libraries shipped next to the
/// binary. Must run at the start of `main`, before threads or ORT exist.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let dirs = candidate_lib_dirs();
    let mut report = RuntimeLibReport::default();

    match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => {
            report.ort_dylib = Some(PathBuf::from(existing));
            report.ort_dylib_from_env = true;
        }
        None => {
            if let Some(path) = find_in_dirs(ORT_LIB_NAME, &dirs) {
                env::set_var(ORT_DYLIB_ENV, &path);
                report.ort_dylib = Some(path);
            }
        }
    }

    report.preloaded = gpu_libs_in_dirs(&dirs)
        .into_iter()
        .filter(|path| load_library(path))
        .collect();
    report
}

pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), from_env = report.ort_dylib_from_env, "ORT library");
        }
        Some(path) => warn!("{ORT_DYLIB_ENV} set to {} but file not found", path.display()),
        None => warn!("{ORT_DYLIB_ENV} not set, ORT will try default search paths"),
    }
    if !report.preloaded.is_empty() {
        info!(count = report.preloaded.len(), "preloaded GPU runtime libraries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn lib_dirs_end_with_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn first_directory_wins() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        let name = binary_file_name("ffprobe");
        std::fs::write(first.join(&name), b"first").unwrap();
        std::fs::write(second.join(&name), b"second").unwrap();

        let resolved = find_in_dirs(&name, &[first.clone(), second]).unwrap();
        assert_eq!(resolved, first.join(name));
    }

    #[test]
    fn missing_binary_is_none() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(find_in_dirs("ffmpeg", &[temp.path().to_path_buf()]), None);
    }

    #[cfg(unix)]
    #[test]
    fn cuda_runtime_sorts_before_cudnn() {
        let temp = tempfile::tempdir().unwrap();
        for name in [
            "libcudnn.so.9",
            "libcudart.so.12",
            "libonnxruntime_providers_cuda.so",
            "libz.so.1",
        ] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }

        let libs = gpu_libs_in_dirs(&[temp.path().to_path_buf()]);
        let names: Vec<_> = libs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["libcudart.so.12", "libcudnn.so.9"]);
    }

    #[cfg(unix)]
    #[test]
    fn provider_and_unrelated_libs_are_not_classified() {
        assert_eq!(GpuLibTier::classify("libonnxruntime.so.1.23.2"), None);
        assert_eq!(GpuLibTier::classify("libsomething_else.so"), None);
        assert_eq!(GpuLibTier::classify("libcublasLt.so.12"), Some(GpuLibTier::CudaRuntime));
    }
}
