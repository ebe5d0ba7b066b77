//! Path layout, thresholds, and timeouts.

use std::time::Duration;

/// Mount point of the shared persistent volume.
pub const VOLUME_ROOT: &str = "/runpod-volume";

/// Workspace used when no persistent volume is available, and the directory
/// pre-deployed code is extracted into.
pub const APP_DIR: &str = "/app";

/// Directory under the volume root containing per-endpoint workspaces.
pub const RUNTIMES_DIR_NAME: &str = "runtimes";

/// Name of the per-endpoint virtual environment directory.
pub const VENV_DIR_NAME: &str = ".venv";

/// Name of the shared language-package cache directory at the volume root.
pub const UV_CACHE_DIR_NAME: &str = ".uv-cache";

/// Name of the shared model cache directory at the volume root.
pub const HF_CACHE_DIR_NAME: &str = ".hf-cache";

/// Name of the delta-tarball directory at the volume root.
pub const VOLUME_CACHE_DIR_NAME: &str = ".cache";

/// Name of the advisory lock taken during workspace initialization.
pub const WORKSPACE_LOCK_FILE: &str = ".initialization.lock";

/// Container-local cache directory mirrored to the volume tarball.
pub const LOCAL_CACHE_DIR: &str = "/root/.cache";

/// Marker file under [`LOCAL_CACHE_DIR`] recording the last hydration.
pub const HYDRATION_MARKER: &str = ".cache-last-hydrated";

/// Location of the deployment manifest inside the app directory.
pub const FLASH_MANIFEST_PATH: &str = "/app/flash_manifest.json";

/// Canonical location of the build artifact on the volume, overridable via
/// `FLASH_BUILD_ARTIFACT_PATH`.
pub const DEFAULT_ARTIFACT_PATH: &str = "/runpod-volume/.flash/build-artifact.tar.gz";

/// Subdirectory of [`APP_DIR`] the network tarball variant extracts into.
pub const PROJECT_DIR: &str = "/app/project";

/// Marker file recording a completed network tarball extraction.
pub const TARBALL_MARKER: &str = ".tarball_loaded";

/// Default bucket for the network tarball variant.
pub const DEFAULT_TARBALL_BUCKET: &str = "tetra-code";

/// Maximum time to wait for workspace initialization by another worker.
pub const WORKSPACE_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between venv checks while waiting on the init lock holder.
pub const INIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hard timeout on package installer subprocesses.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout on the trivial interpreter invocation used to validate a venv.
pub const VENV_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout on artifact downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Maximum age of the local manifest before a refresh is attempted.
pub const MANIFEST_TTL: Duration = Duration::from_secs(300);

/// Attempts at unpacking the build artifact before giving up.
pub const UNPACK_ATTEMPTS: u32 = 3;

/// Pause between unpack attempts.
pub const UNPACK_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum number of log lines retained for a single response.
pub const LOG_BUFFER_CAPACITY: usize = 1000;

/// System packages large enough to benefit from accelerated installation.
pub const LARGE_SYSTEM_PACKAGES: &[&str] = &[
    "build-essential",
    "cmake",
    "cuda-toolkit",
    "curl",
    "g++",
    "gcc",
    "git",
    "libssl-dev",
    "nvidia-cuda-dev",
    "python3-dev",
    "wget",
];
