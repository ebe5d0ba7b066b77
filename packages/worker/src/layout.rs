//! Volume detection and the endpoint-scoped path layout.
//!
//! Per-endpoint artifacts (the venv, the init lock) live under
//! `runtimes/<endpoint_id>` on the shared volume; the package and model
//! caches are siblings at the volume root and shared by every endpoint.
//! When no volume is mounted, the worker falls back to the in-container
//! app directory with no venv and no caches.

use std::{
    env,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};

use crate::constants::{
    APP_DIR, HF_CACHE_DIR_NAME, RUNTIMES_DIR_NAME, UV_CACHE_DIR_NAME, VENV_DIR_NAME, VOLUME_ROOT,
    WORKSPACE_LOCK_FILE,
};

/// The derived path layout for this worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkspaceLayout {
    /// The volume mount point, when one is present.
    pub volume_root: Option<PathBuf>,

    /// Endpoint identifier from the environment, or `"default"`.
    pub endpoint_id: String,

    /// The endpoint-scoped workspace directory.
    pub workspace: PathBuf,

    /// The per-endpoint virtual environment. `None` without a volume.
    pub venv: Option<PathBuf>,

    /// Shared language-package cache at the volume root.
    pub pkg_cache: Option<PathBuf>,

    /// Shared model cache at the volume root.
    pub model_cache: Option<PathBuf>,

    /// The container-local app directory (pre-deployed code, the `.venv`
    /// compatibility symlink).
    pub app_dir: PathBuf,
}

impl WorkspaceLayout {
    /// Detect the layout from the environment and filesystem.
    #[instrument]
    pub fn detect() -> Self {
        let endpoint_id =
            env::var("RUNPOD_ENDPOINT_ID").unwrap_or_else(|_| String::from("default"));
        let volume_root = Path::new(VOLUME_ROOT);
        let layout = if volume_root.exists() {
            Self::on_volume(volume_root, &endpoint_id)
        } else {
            Self::in_container(&endpoint_id)
        };
        debug!(?layout, "detected workspace layout");
        layout
    }

    /// Layout rooted at a mounted volume.
    pub fn on_volume(volume_root: &Path, endpoint_id: &str) -> Self {
        let workspace = volume_root.join(RUNTIMES_DIR_NAME).join(endpoint_id);
        Self {
            venv: Some(workspace.join(VENV_DIR_NAME)),
            pkg_cache: Some(volume_root.join(UV_CACHE_DIR_NAME)),
            model_cache: Some(volume_root.join(HF_CACHE_DIR_NAME)),
            volume_root: Some(volume_root.to_path_buf()),
            endpoint_id: endpoint_id.to_string(),
            workspace,
            app_dir: PathBuf::from(APP_DIR),
        }
    }

    /// Fallback layout when no volume is mounted.
    pub fn in_container(endpoint_id: &str) -> Self {
        Self {
            volume_root: None,
            endpoint_id: endpoint_id.to_string(),
            workspace: PathBuf::from(APP_DIR),
            venv: None,
            pkg_cache: None,
            model_cache: None,
            app_dir: PathBuf::from(APP_DIR),
        }
    }

    pub fn has_volume(&self) -> bool {
        self.volume_root.is_some()
    }

    /// Path of the advisory init lock inside the workspace.
    pub fn lock_file(&self) -> PathBuf {
        self.workspace.join(WORKSPACE_LOCK_FILE)
    }

    /// The venv's interpreter executable, when a venv is configured.
    pub fn python_exe(&self) -> Option<PathBuf> {
        self.venv.as_ref().map(|venv| venv.join("bin").join("python3"))
    }

    /// The venv's site-packages directories, resolved through the
    /// version-specific `lib/pythonX.Y` layer.
    pub fn site_packages(&self) -> Vec<PathBuf> {
        let Some(venv) = &self.venv else {
            return Vec::new();
        };
        let lib = venv.join("lib");
        let Ok(entries) = std::fs::read_dir(&lib) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("python")
            })
            .map(|entry| entry.path().join("site-packages"))
            .filter(|path| path.is_dir())
            .collect()
    }

    /// Export the cache-directory hints consumed by child installers and
    /// user code. No-op without a volume.
    #[instrument(skip(self))]
    pub fn export_cache_env(&self) {
        if let Some(pkg_cache) = &self.pkg_cache {
            set_env("UV_CACHE_DIR", pkg_cache);
        }
        if let Some(model_cache) = &self.model_cache {
            if let Err(err) = std::fs::create_dir_all(model_cache) {
                warn!(?model_cache, ?err, "failed to create model cache directory");
            }
            set_env("HF_HOME", model_cache);
            set_env("TRANSFORMERS_CACHE", model_cache.join("transformers"));
            set_env("HF_DATASETS_CACHE", model_cache.join("datasets"));
            set_env("HUGGINGFACE_HUB_CACHE", model_cache.join("hub"));
        }
    }

    /// Export the venv environment: `VIRTUAL_ENV`, a `PATH` that prefers the
    /// venv's binaries, and a `PYTHONPATH` that includes the volume
    /// site-packages. No-op without a venv.
    #[instrument(skip(self))]
    pub fn export_venv_env(&self) {
        let Some(venv) = &self.venv else {
            return;
        };
        set_env("VIRTUAL_ENV", venv);

        let venv_bin = venv.join("bin");
        let path = env::var("PATH").unwrap_or_default();
        set_env("PATH", format!("{}:{path}", venv_bin.display()));

        let site_packages = self.site_packages();
        if !site_packages.is_empty() {
            let joined = site_packages
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":");
            let pythonpath = match env::var("PYTHONPATH") {
                Ok(existing) if !existing.is_empty() => format!("{joined}:{existing}"),
                _ => joined,
            };
            info!(%pythonpath, "set PYTHONPATH to include volume packages");
            set_env("PYTHONPATH", pythonpath);
        }
    }
}

fn set_env(key: &str, value: impl AsRef<std::ffi::OsStr>) {
    // SAFETY: environment mutation happens during single-threaded worker
    // startup and between jobs, never concurrently with reads from child
    // process spawns.
    unsafe { env::set_var(key, value) }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn volume_layout_scopes_workspace_by_endpoint() {
        let layout = WorkspaceLayout::on_volume(Path::new("/runpod-volume"), "ep-42");
        assert_eq!(
            layout.workspace,
            PathBuf::from("/runpod-volume/runtimes/ep-42")
        );
        assert_eq!(
            layout.venv.as_deref(),
            Some(Path::new("/runpod-volume/runtimes/ep-42/.venv"))
        );
        assert_eq!(
            layout.lock_file(),
            PathBuf::from("/runpod-volume/runtimes/ep-42/.initialization.lock")
        );
    }

    #[test]
    fn caches_are_siblings_at_the_volume_root() {
        let a = WorkspaceLayout::on_volume(Path::new("/runpod-volume"), "ep-a");
        let b = WorkspaceLayout::on_volume(Path::new("/runpod-volume"), "ep-b");
        assert_eq!(a.pkg_cache, b.pkg_cache);
        assert_eq!(a.model_cache, b.model_cache);
        assert_eq!(
            a.pkg_cache.as_deref(),
            Some(Path::new("/runpod-volume/.uv-cache"))
        );
        assert_eq!(
            a.model_cache.as_deref(),
            Some(Path::new("/runpod-volume/.hf-cache"))
        );
    }

    #[test]
    fn container_layout_has_no_venv_or_caches() {
        let layout = WorkspaceLayout::in_container("default");
        assert!(!layout.has_volume());
        assert_eq!(layout.workspace, PathBuf::from("/app"));
        assert_eq!(layout.venv, None);
        assert_eq!(layout.pkg_cache, None);
        assert_eq!(layout.python_exe(), None);
        assert!(layout.site_packages().is_empty());
    }

    #[test]
    fn python_exe_lives_in_venv_bin() {
        let layout = WorkspaceLayout::on_volume(Path::new("/vol"), "default");
        assert_eq!(
            layout.python_exe().unwrap(),
            PathBuf::from("/vol/runtimes/default/.venv/bin/python3")
        );
    }
}
