//! Installation of OS and language packages.
//!
//! Language packages go through `uv` when acceleration is requested and
//! available, falling back to plain `pip`. OS packages go through `nala`
//! only when acceleration is requested, at least one requested package is
//! known-large, and `nala` is present; otherwise `apt-get`. Availability of
//! each accelerated front-end is probed once and memoized for the worker's
//! lifetime.
//!
//! When a volume venv exists, language installs are differential: the
//! currently installed set is queried first and already-satisfied requests
//! are dropped before any installer subprocess runs.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::{
    constants::{INSTALL_TIMEOUT, LARGE_SYSTEM_PACKAGES},
    layout::WorkspaceLayout,
    subprocess::{CommandOutput, RunOptions, run_logged},
};

/// Installs system and language dependencies.
pub struct DependencyInstaller {
    layout: WorkspaceLayout,
    uv_available: OnceCell<bool>,
    nala_available: OnceCell<bool>,
}

impl DependencyInstaller {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self {
            layout,
            uv_available: OnceCell::new(),
            nala_available: OnceCell::new(),
        }
    }

    /// Install language packages.
    #[instrument(skip(self))]
    pub async fn install_language(&self, packages: &[String], accelerate: bool) -> CommandOutput {
        if packages.is_empty() {
            return CommandOutput::ok("No packages to install");
        }

        let packages = match self.missing_packages(packages).await {
            Some(missing) if missing.is_empty() => {
                return CommandOutput::ok("All requested packages already installed");
            }
            Some(missing) => missing,
            None => packages.to_vec(),
        };

        info!(?packages, "installing language dependencies");

        let (program, args): (&str, Vec<String>) = if accelerate && self.uv_available().await {
            (
                "uv",
                ["pip", "install", "--system"]
                    .into_iter()
                    .map(String::from)
                    .chain(packages.iter().cloned())
                    .collect(),
            )
        } else {
            (
                "pip",
                std::iter::once(String::from("install"))
                    .chain(packages.iter().cloned())
                    .collect(),
            )
        };

        let mode = if accelerate { "accelerated" } else { "standard" };
        run_logged(
            program,
            args,
            format!("Installing language packages ({mode})"),
            RunOptions {
                timeout: Some(INSTALL_TIMEOUT),
                ..RunOptions::default()
            },
        )
        .await
    }

    /// Install OS packages.
    ///
    /// On a non-Linux platform (local testing) this is a successful no-op:
    /// a job must never fail because the OS package manager is unavailable.
    #[instrument(skip(self))]
    pub async fn install_system(&self, packages: &[String], accelerate: bool) -> CommandOutput {
        if !cfg!(target_os = "linux") {
            warn!("system package installation not supported on this platform");
            return CommandOutput::ok(format!("Skipped system packages: {packages:?}"));
        }
        if packages.is_empty() {
            return CommandOutput::ok("No system packages to install");
        }

        info!(?packages, "installing system dependencies");

        let large = large_system_packages(packages);
        if accelerate && !large.is_empty() && self.nala_available().await {
            self.install_system_with_nala(packages).await
        } else {
            self.install_system_standard(packages).await
        }
    }

    /// Accelerated path; any failure falls back to the baseline installer
    /// exactly once.
    async fn install_system_with_nala(&self, packages: &[String]) -> CommandOutput {
        let update = run_logged(
            "nala",
            ["update"],
            "Updating package list with nala",
            RunOptions {
                timeout: Some(INSTALL_TIMEOUT),
                ..RunOptions::default()
            },
        )
        .await;
        if !update.success {
            warn!("nala update failed, falling back to standard installation");
            return self.install_system_standard(packages).await;
        }

        let install = run_logged(
            "nala",
            ["install", "-y"]
                .into_iter()
                .map(String::from)
                .chain(packages.iter().cloned()),
            "Installing system packages with nala",
            RunOptions {
                timeout: Some(INSTALL_TIMEOUT),
                env: noninteractive_env(),
                ..RunOptions::default()
            },
        )
        .await;
        if !install.success {
            warn!("nala installation failed, falling back to standard installation");
            return self.install_system_standard(packages).await;
        }

        info!(?packages, "successfully installed system packages with nala");
        CommandOutput::ok(format!("Installed with nala: {}", install.stdout))
    }

    async fn install_system_standard(&self, packages: &[String]) -> CommandOutput {
        let update = run_logged(
            "apt-get",
            ["update"],
            "Updating package list with apt-get",
            RunOptions {
                timeout: Some(INSTALL_TIMEOUT),
                ..RunOptions::default()
            },
        )
        .await;
        if !update.success {
            let error = format!("error updating package list: {}", update.error_message());
            return CommandOutput {
                success: false,
                stdout: update.stdout,
                error: Some(error),
            };
        }

        let install = run_logged(
            "apt-get",
            ["install", "-y", "--no-install-recommends"]
                .into_iter()
                .map(String::from)
                .chain(packages.iter().cloned()),
            "Installing system packages with apt-get",
            RunOptions {
                timeout: Some(INSTALL_TIMEOUT),
                env: noninteractive_env(),
                ..RunOptions::default()
            },
        )
        .await;
        if !install.success {
            let error = format!(
                "error installing system packages: {}",
                install.error_message()
            );
            return CommandOutput {
                success: false,
                stdout: install.stdout,
                error: Some(error),
            };
        }

        info!(?packages, "successfully installed system packages");
        install
    }

    /// The requested packages not already satisfied by the volume venv.
    /// `None` when no differential check applies (no functional venv).
    async fn missing_packages(&self, requested: &[String]) -> Option<Vec<String>> {
        let venv = self.layout.venv.as_ref()?;
        if !venv.exists() {
            return None;
        }

        let listed = run_logged(
            "uv",
            ["pip", "list", "--format=freeze"],
            "Listing installed packages",
            RunOptions {
                timeout: Some(INSTALL_TIMEOUT),
                env: HashMap::from([(
                    String::from("VIRTUAL_ENV"),
                    venv.display().to_string(),
                )]),
                quiet: true,
                ..RunOptions::default()
            },
        )
        .await;
        if !listed.success {
            return None;
        }

        let installed = parse_freeze(&listed.stdout);
        Some(filter_missing(requested, &installed))
    }

    async fn uv_available(&self) -> bool {
        *self
            .uv_available
            .get_or_init(|| crate::subprocess::which("uv"))
            .await
    }

    async fn nala_available(&self) -> bool {
        *self
            .nala_available
            .get_or_init(|| crate::subprocess::which("nala"))
            .await
    }
}

fn noninteractive_env() -> HashMap<String, String> {
    HashMap::from([(
        String::from("DEBIAN_FRONTEND"),
        String::from("noninteractive"),
    )])
}

/// Requested packages matching the known-large patterns.
pub fn large_system_packages(packages: &[String]) -> Vec<&String> {
    packages
        .iter()
        .filter(|package| {
            LARGE_SYSTEM_PACKAGES
                .iter()
                .any(|pattern| package.contains(pattern))
        })
        .collect()
}

/// Parse `pip list --format=freeze` output into a name to version map.
pub fn parse_freeze(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once("=="))
        .map(|(name, version)| (name.trim().to_string(), version.trim().to_string()))
        .collect()
}

/// Drop requested specifiers already satisfied by the installed set.
///
/// A pinned `name==version` is satisfied only by that exact version; a bare
/// `name` is satisfied by any installed version.
pub fn filter_missing(requested: &[String], installed: &BTreeMap<String, String>) -> Vec<String> {
    requested
        .iter()
        .filter(|spec| match spec.split_once("==") {
            Some((name, version)) => installed.get(name.trim()).map(String::as_str) != Some(version.trim()),
            None => !installed.contains_key(spec.trim()),
        })
        .cloned()
        .collect()
}
