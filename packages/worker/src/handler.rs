//! Job orchestration: the request path from envelope to response.
//!
//! Within a job the ordering is fixed: hydrate (only when the job declares
//! dependencies), then install, then publish the cache delta
//! (fire-and-forget), then route and execute. Installation is the only
//! step that fans out: with
//! acceleration on, OS and language packages install as two concurrent
//! tasks joined before execution; with acceleration off they run
//! sequentially, system first.
//!
//! Nothing here escapes as a process-level crash. Every failure becomes a
//! `Response` with `success = false`, and captured log lines ride along in
//! `stdout` either way.

use std::sync::Arc;

use tracing::{debug, instrument};

use clients::flash::v1::{ExecutionType, Job, Response};

use crate::{
    cache_sync::CacheSyncManager,
    constants::{FLASH_MANIFEST_PATH, WORKSPACE_INIT_TIMEOUT},
    deps::DependencyInstaller,
    layout::WorkspaceLayout,
    logs,
    manifest::{ServiceRegistry, is_flash_deployment},
    router::ExecutionRouter,
    shim::ShimHost,
    subprocess::CommandOutput,
    workspace::{InitOutcome, WorkspaceManager},
};

/// The worker's request handler.
pub struct Handler {
    workspace: WorkspaceManager,
    installer: DependencyInstaller,
    cache_sync: Arc<CacheSyncManager>,
    router: ExecutionRouter,
    shim: Arc<ShimHost>,
}

impl Handler {
    /// Build a handler from the detected environment.
    pub fn new() -> Self {
        let layout = WorkspaceLayout::detect();
        let shim = Arc::new(ShimHost::new(layout.clone()));
        let registry = is_flash_deployment()
            .then(|| ServiceRegistry::new(FLASH_MANIFEST_PATH, layout.endpoint_id.clone()));

        Self {
            workspace: WorkspaceManager::new(layout.clone()),
            installer: DependencyInstaller::new(layout.clone()),
            cache_sync: Arc::new(CacheSyncManager::new()),
            router: ExecutionRouter::new(Arc::clone(&shim), registry),
            shim,
        }
    }

    pub fn router(&self) -> &ExecutionRouter {
        &self.router
    }

    /// The interpreter host shared by every executor.
    pub fn shim(&self) -> &Arc<ShimHost> {
        &self.shim
    }

    /// Handle a raw ingress payload: `{"input": <Job>}` or a bare job.
    ///
    /// Malformed payloads yield a failure response, never an error to the
    /// host.
    pub async fn handle_envelope(&self, payload: serde_json::Value) -> Response {
        let job = match payload.get("input") {
            Some(input) => serde_json::from_value::<Job>(input.clone()),
            None => serde_json::from_value::<Job>(payload),
        };
        match job {
            Ok(job) => self.handle(&job).await,
            Err(err) => Response::err(format!("malformed job envelope: {err}")),
        }
    }

    /// Handle one job end to end.
    #[instrument(skip_all, fields(target = job.target()))]
    pub async fn handle(&self, job: &Job) -> Response {
        logs::start_streaming(logs::requested_level());
        debug!(
            "executing {:?} request: {}",
            job.execution_type,
            job.target()
        );

        let response = self.run_job(job).await;

        // Drain after user code so the final stdout carries every line.
        let captured = logs::drain_streamed_logs();
        logs::stop_streaming();
        response.prepend_logs(&captured)
    }

    async fn run_job(&self, job: &Job) -> Response {
        if let Err(error) = validate(job) {
            return Response::err(error);
        }

        let init = self.workspace.initialize(WORKSPACE_INIT_TIMEOUT).await;
        match init {
            InitOutcome::Ready { .. } => {}
            InitOutcome::Timeout => {
                return Response::err(
                    "workspace initialization timeout; consider a longer timeout",
                );
            }
            other => return Response::err(other.to_string()),
        }
        self.workspace.setup_search_path().await;

        let has_installs = !job.dependencies.is_empty() || !job.system_dependencies.is_empty();
        if has_installs {
            self.cache_sync.hydrate_from_volume().await;
        }
        self.cache_sync.mark_baseline();

        let installed = if job.accelerate_downloads {
            self.install_parallel(job).await
        } else {
            self.install_sequential(job).await
        };
        if !installed.success {
            let error = installed.error_message().to_string();
            return Response::err_with_output(error, installed.stdout);
        }

        // Publish the cache delta in the background; the job does not wait
        // for it, and a worker teardown mid-sync only costs a cache update.
        let cache_sync = Arc::clone(&self.cache_sync);
        tokio::spawn(async move { cache_sync.sync_to_volume().await });

        self.router.route(job).await
    }

    async fn install_parallel(&self, job: &Job) -> CommandOutput {
        let system = !job.system_dependencies.is_empty();
        let language = !job.dependencies.is_empty();

        let results = match (system, language) {
            (false, false) => return CommandOutput::ok("No dependencies to install"),
            (true, false) => vec![(
                "system_dependencies",
                self.installer
                    .install_system(&job.system_dependencies, true)
                    .await,
            )],
            (false, true) => vec![(
                "python_dependencies",
                self.installer.install_language(&job.dependencies, true).await,
            )],
            (true, true) => {
                debug!("starting parallel installation of 2 tasks");
                let (system_result, language_result) = tokio::join!(
                    self.installer.install_system(&job.system_dependencies, true),
                    self.installer.install_language(&job.dependencies, true),
                );
                vec![
                    ("system_dependencies", system_result),
                    ("python_dependencies", language_result),
                ]
            }
        };

        aggregate_results(results)
    }

    async fn install_sequential(&self, job: &Job) -> CommandOutput {
        if !job.system_dependencies.is_empty() {
            let result = self
                .installer
                .install_system(&job.system_dependencies, false)
                .await;
            if !result.success {
                return result;
            }
        }
        if !job.dependencies.is_empty() {
            let result = self.installer.install_language(&job.dependencies, false).await;
            if !result.success {
                return result;
            }
        }
        CommandOutput::ok("Dependencies installed successfully")
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

/// Require the fields without which the job cannot be routed at all.
fn validate(job: &Job) -> Result<(), String> {
    match job.execution_type {
        ExecutionType::Function if job.function_name.is_none() => {
            Err(String::from("function_name is required"))
        }
        ExecutionType::Class if job.class_name.is_none() => {
            Err(String::from("class_name is required"))
        }
        _ => Ok(()),
    }
}

/// Fold per-task install results into one. Success requires all tasks to
/// succeed; the aggregate error lists each failure.
fn aggregate_results(results: Vec<(&str, CommandOutput)>) -> CommandOutput {
    let total = results.len();
    let mut failures = Vec::new();
    let mut stdout_parts = Vec::new();
    let mut succeeded = 0usize;

    for (name, result) in results {
        if result.success {
            succeeded += 1;
            stdout_parts.push(format!("{name}: {}", result.stdout.trim()));
        } else {
            failures.push(format!("{name}: {}", result.error_message()));
        }
    }

    let stdout = format!(
        "Parallel installation: {succeeded}/{total} tasks succeeded\n{}",
        stdout_parts.join("\n")
    );
    if failures.is_empty() {
        CommandOutput {
            success: true,
            stdout,
            error: None,
        }
    } else {
        CommandOutput {
            success: false,
            stdout,
            error: Some(format!("failed tasks: {}", failures.join("; "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn validation_requires_a_target_name() {
        let job = Job::default();
        assert_eq!(validate(&job).unwrap_err(), "function_name is required");

        let job = Job {
            execution_type: ExecutionType::Class,
            ..Job::default()
        };
        assert_eq!(validate(&job).unwrap_err(), "class_name is required");

        let job = Job {
            function_name: Some(String::from("f")),
            ..Job::default()
        };
        assert!(validate(&job).is_ok());
    }

    #[test]
    fn aggregate_success_requires_all_tasks() {
        let all_ok = aggregate_results(vec![
            ("system_dependencies", CommandOutput::ok("done")),
            ("python_dependencies", CommandOutput::ok("done")),
        ]);
        assert!(all_ok.success);
        assert!(all_ok.stdout.contains("2/2 tasks succeeded"));

        let one_failed = aggregate_results(vec![
            ("system_dependencies", CommandOutput::ok("done")),
            ("python_dependencies", CommandOutput::err("resolver blew up")),
        ]);
        assert!(!one_failed.success);
        let error = one_failed.error.unwrap();
        assert!(error.contains("python_dependencies"));
        assert!(error.contains("resolver blew up"));
        assert!(one_failed.stdout.contains("1/2 tasks succeeded"));
    }

    #[test]
    fn aggregate_lists_every_failure() {
        let both_failed = aggregate_results(vec![
            ("system_dependencies", CommandOutput::err("apt broke")),
            ("python_dependencies", CommandOutput::err("pip broke")),
        ]);
        let error = both_failed.error.unwrap();
        assert!(error.contains("apt broke"));
        assert!(error.contains("pip broke"));
    }
}
