//! Workspace initialization on the shared volume.
//!
//! Sibling workers of one endpoint race to initialize the same venv at
//! startup. The winner holds an advisory file lock while it builds the
//! environment; the losers poll until the venv appears and validates, or
//! until the timeout elapses. A venv left broken by a previous failed
//! initialization is removed and rebuilt.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use derive_more::Display;
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

use crate::{
    constants::{INIT_POLL_INTERVAL, VENV_DIR_NAME, VENV_VALIDATION_TIMEOUT},
    layout::WorkspaceLayout,
    subprocess::{RunOptions, run_logged},
};

/// The outcome of workspace initialization.
///
/// `Ready` covers the trivial no-volume case and every way an environment
/// can already (or newly) be functional; the other variants abort the job.
#[derive(Clone, Debug, Eq, PartialEq, Display)]
pub enum InitOutcome {
    #[display("{note}")]
    Ready { note: String },

    #[display("workspace initialization timeout")]
    Timeout,

    #[display("workspace not writable: {error}")]
    PermissionError { error: String },

    #[display("failed to create virtual environment: {error}")]
    CreationFailed { error: String },
}

impl InitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    fn ready(note: impl Into<String>) -> Self {
        Self::Ready { note: note.into() }
    }
}

/// Manages the endpoint-scoped environment on the shared volume.
pub struct WorkspaceManager {
    layout: WorkspaceLayout,
}

impl WorkspaceManager {
    /// Create a manager and export the cache-directory environment for
    /// child installers.
    pub fn new(layout: WorkspaceLayout) -> Self {
        if layout.has_volume() {
            layout.export_cache_env();
        }
        Self { layout }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Initialize the workspace, tolerating concurrent workers.
    #[instrument(skip(self), fields(endpoint = %self.layout.endpoint_id))]
    pub async fn initialize(&self, timeout: Duration) -> InitOutcome {
        if !self.layout.has_volume() {
            return InitOutcome::ready("No volume available, using container workspace");
        }

        // Already functional? The common warm-start path.
        if let Some(venv) = &self.layout.venv {
            if venv.exists() {
                match self.validate_venv().await {
                    Ok(()) => return InitOutcome::ready("Workspace already initialized"),
                    Err(error) => {
                        warn!(%error, "virtual environment validation failed, recreating");
                        self.remove_broken_venv().await;
                    }
                }
            }
        }

        if let Err(error) = tokio::fs::create_dir_all(&self.layout.workspace).await {
            return InitOutcome::PermissionError {
                error: format!("create workspace directory: {error}"),
            };
        }
        if let Err(error) = self.probe_writable().await {
            return InitOutcome::PermissionError { error };
        }

        let lock_path = self.layout.lock_file();
        let outcome = self.initialize_locked(&lock_path, timeout).await;

        // The lock file itself is scratch; leaving it behind is harmless but
        // messy, so best-effort removal on every exit path.
        if let Err(err) = tokio::fs::remove_file(&lock_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(?lock_path, ?err, "failed to remove lock file");
            }
        }

        outcome
    }

    async fn initialize_locked(&self, lock_path: &Path, timeout: Duration) -> InitOutcome {
        let lock = {
            let lock_path = lock_path.to_path_buf();
            spawn_blocking(move || -> Result<Option<fslock::LockFile>, String> {
                let mut lock = fslock::LockFile::open(&lock_path)
                    .map_err(|err| format!("open lock file: {err}"))?;
                let acquired = lock
                    .try_lock()
                    .map_err(|err| format!("acquire lock: {err}"))?;
                Ok(acquired.then_some(lock))
            })
            .await
        };

        let lock = match lock {
            Ok(Ok(lock)) => lock,
            Ok(Err(error)) => return InitOutcome::PermissionError { error },
            Err(err) => {
                return InitOutcome::PermissionError {
                    error: format!("join lock task: {err}"),
                };
            }
        };

        match lock {
            Some(mut lock) => {
                // Someone else may have finished between our existence check
                // and the lock acquisition.
                let outcome = if self.venv_is_functional().await {
                    InitOutcome::ready("Workspace already initialized")
                } else {
                    self.create_venv().await
                };

                let _ = spawn_blocking(move || lock.unlock()).await;
                outcome
            }
            None => self.wait_for_other_worker(timeout).await,
        }
    }

    /// Poll until another worker's initialization produces a functional
    /// venv, or until the timeout elapses. Never waits holding the lock.
    async fn wait_for_other_worker(&self, timeout: Duration) -> InitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.venv_is_functional().await {
                return InitOutcome::ready("Workspace initialized by another worker");
            }
            tokio::time::sleep(INIT_POLL_INTERVAL).await;
        }
        InitOutcome::Timeout
    }

    async fn venv_is_functional(&self) -> bool {
        match &self.layout.venv {
            Some(venv) => venv.exists() && self.validate_venv().await.is_ok(),
            None => false,
        }
    }

    async fn create_venv(&self) -> InitOutcome {
        let Some(venv) = &self.layout.venv else {
            return InitOutcome::CreationFailed {
                error: String::from("virtual environment path not configured"),
            };
        };

        let result = run_logged(
            "uv",
            ["venv", &venv.display().to_string()],
            "Creating virtual environment",
            RunOptions::default(),
        )
        .await;

        if result.success {
            self.create_app_venv_symlink().await;
            InitOutcome::ready(result.stdout)
        } else {
            InitOutcome::CreationFailed {
                error: result.error_message().to_string(),
            }
        }
    }

    /// Validate that the venv is functional: the interpreter exists, is not
    /// a dangling symlink, and can execute a trivial command.
    #[instrument(skip(self))]
    pub async fn validate_venv(&self) -> Result<(), String> {
        let Some(python_exe) = self.layout.python_exe() else {
            return Err(String::from("virtual environment does not exist"));
        };

        // Presence check that does not follow symlinks, so a dangling link
        // is distinguishable from a missing interpreter.
        if tokio::fs::symlink_metadata(&python_exe).await.is_err() {
            return Err(format!(
                "python executable not found at {}",
                python_exe.display()
            ));
        }

        // Resolves the full symlink chain; a dangling link errors here.
        if let Err(err) = tokio::fs::canonicalize(&python_exe).await {
            return Err(format!(
                "broken symlink at {}: {err}",
                python_exe.display()
            ));
        }

        let result = run_logged(
            python_exe.display().to_string(),
            ["-c", "import sys; print(sys.version)"],
            "Validating virtual environment",
            RunOptions {
                timeout: Some(VENV_VALIDATION_TIMEOUT),
                quiet: true,
                ..RunOptions::default()
            },
        )
        .await;

        if result.success {
            Ok(())
        } else {
            Err(format!(
                "python interpreter failed to execute: {}",
                result.error_message()
            ))
        }
    }

    /// Idempotently expose the venv to child interpreters via the process
    /// environment. No-op if no volume or the environment is invalid.
    #[instrument(skip(self))]
    pub async fn setup_search_path(&self) {
        if !self.layout.has_volume() {
            return;
        }
        let Some(venv) = &self.layout.venv else {
            return;
        };
        if !venv.exists() {
            return;
        }
        if let Err(error) = self.validate_venv().await {
            warn!(%error, "virtual environment is invalid, not adding to search path");
            return;
        }
        self.layout.export_venv_env();
    }

    async fn probe_writable(&self) -> Result<(), String> {
        let probe = self.layout.workspace.join(".write-probe");
        tokio::fs::write(&probe, b"probe")
            .await
            .map_err(|err| format!("probe write to {}: {err}", probe.display()))?;
        let _ = tokio::fs::remove_file(&probe).await;
        Ok(())
    }

    async fn remove_broken_venv(&self) {
        let Some(venv) = &self.layout.venv else {
            return;
        };
        match tokio::fs::remove_dir_all(venv).await {
            Ok(()) => info!(?venv, "removed broken virtual environment"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(?venv, ?err, "error removing broken virtual environment"),
        }
        self.remove_app_venv_symlink().await;
    }

    /// Symlink the container-local `.venv` path at the volume venv, for
    /// libraries that hardcode the container path.
    async fn create_app_venv_symlink(&self) {
        let Some(venv) = &self.layout.venv else {
            return;
        };
        let app_venv = self.app_venv_path();

        let removed = match tokio::fs::symlink_metadata(&app_venv).await {
            Ok(meta) if meta.is_dir() && !meta.is_symlink() => {
                tokio::fs::remove_dir_all(&app_venv).await
            }
            Ok(_) => tokio::fs::remove_file(&app_venv).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = removed {
            warn!(?app_venv, ?err, "failed to clear existing app venv path");
            return;
        }

        match tokio::fs::symlink(venv, &app_venv).await {
            Ok(()) => info!(?app_venv, ?venv, "created app venv symlink"),
            Err(err) => warn!(?app_venv, ?err, "failed to create app venv symlink"),
        }
    }

    /// Remove the container-local symlink, but only if it points at our
    /// venv.
    async fn remove_app_venv_symlink(&self) {
        let Some(venv) = &self.layout.venv else {
            return;
        };
        let app_venv = self.app_venv_path();
        match tokio::fs::read_link(&app_venv).await {
            Ok(target) if &target == venv => {
                if let Err(err) = tokio::fs::remove_file(&app_venv).await {
                    warn!(?app_venv, ?err, "failed to remove app venv symlink");
                }
            }
            _ => {}
        }
    }

    fn app_venv_path(&self) -> PathBuf {
        self.layout.app_dir.join(VENV_DIR_NAME)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn manager_at(root: &Path, endpoint: &str) -> WorkspaceManager {
        let mut layout = WorkspaceLayout::on_volume(root, endpoint);
        // Keep the compatibility symlink inside the fixture.
        layout.app_dir = root.join("app");
        WorkspaceManager { layout }
    }

    #[tokio::test]
    async fn no_volume_initializes_trivially() {
        let manager = WorkspaceManager {
            layout: WorkspaceLayout::in_container("default"),
        };
        let outcome = manager.initialize(Duration::from_secs(1)).await;
        assert_eq!(
            outcome,
            InitOutcome::ready("No volume available, using container workspace")
        );
    }

    #[tokio::test]
    async fn uncreatable_workspace_is_a_permission_error() {
        let temp = tempfile::tempdir().unwrap();
        let volume = temp.path().join("vol");
        std::fs::create_dir_all(&volume).unwrap();
        // A plain file where the runtimes directory should go blocks
        // workspace creation even for privileged users.
        std::fs::write(volume.join("runtimes"), b"not a directory").unwrap();

        let manager = manager_at(&volume, "ep");
        let outcome = manager.initialize(Duration::from_millis(100)).await;
        assert!(
            matches!(outcome, InitOutcome::PermissionError { .. }),
            "expected permission error, got {outcome:?}"
        );
    }

    #[tokio::test]
    async fn validation_rejects_missing_interpreter() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager_at(temp.path(), "ep");
        let error = manager.validate_venv().await.unwrap_err();
        assert!(error.contains("not found"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn validation_rejects_dangling_symlink() {
        let temp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::on_volume(temp.path(), "ep");
        let python_exe = layout.python_exe().unwrap();
        std::fs::create_dir_all(python_exe.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("/nonexistent/python3", &python_exe).unwrap();

        let manager = WorkspaceManager { layout };
        let error = manager.validate_venv().await.unwrap_err();
        assert!(
            error.contains("broken symlink"),
            "unexpected error: {error}"
        );
    }

    #[tokio::test]
    async fn waiting_on_the_lock_holder_times_out_without_a_venv() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager_at(temp.path(), "ep");
        std::fs::create_dir_all(&manager.layout.workspace).unwrap();

        // The venv never appears, so the poll loop must give up.
        let outcome = manager
            .wait_for_other_worker(Duration::from_millis(100))
            .await;
        assert_eq!(outcome, InitOutcome::Timeout);
    }

    #[tokio::test]
    async fn lock_file_is_removed_after_initialization() {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager_at(temp.path(), "ep");

        // Creation fails (no `uv` pointing at a real interpreter is
        // required for this assertion; even a failed attempt must clean up).
        let _ = manager.initialize(Duration::from_millis(100)).await;
        assert!(!manager.layout.lock_file().exists());
    }
}
