//! Dual-mode dispatch: live inline code, pre-deployed local functions, or
//! cross-endpoint forwarding.
//!
//! Live jobs (inline source present) go straight to the function or class
//! executor. Flash jobs consult the service registry first: if the target
//! function's resource is this endpoint, it executes locally with zero
//! network traffic: no state-manager query, no forwarding. Only a remote
//! target triggers the TTL-gated manifest refresh, and only after routing
//! has committed to an endpoint URL is an unreachable endpoint an error
//! (never a silent local fallback, which could duplicate side effects).

use std::sync::Arc;

use tracing::{debug, instrument, warn};
use url::Url;

use clients::{
    Token,
    flash::v1::{Endpoint, ExecutionType, Job, Response},
};

use crate::{
    constants::MANIFEST_TTL,
    executor::{ClassExecutor, FlashExecutor, FunctionExecutor},
    manifest::ServiceRegistry,
    shim::ShimHost,
};

/// Routes each job to an executor or a sibling endpoint.
pub struct ExecutionRouter {
    function_executor: FunctionExecutor,
    class_executor: ClassExecutor,
    flash_executor: FlashExecutor,

    /// Absent outside Flash deployments; every pre-deployed job then
    /// attempts local execution directly.
    registry: Option<ServiceRegistry>,
}

impl ExecutionRouter {
    pub fn new(shim: Arc<ShimHost>, registry: Option<ServiceRegistry>) -> Self {
        Self {
            function_executor: FunctionExecutor::new(Arc::clone(&shim)),
            class_executor: ClassExecutor::new(Arc::clone(&shim)),
            flash_executor: FlashExecutor::new(shim),
            registry,
        }
    }

    pub fn class_executor(&self) -> &ClassExecutor {
        &self.class_executor
    }

    #[instrument(skip_all, fields(target = job.target(), live = job.is_live()))]
    pub async fn route(&self, job: &Job) -> Response {
        if job.is_live() {
            debug!("live mode, executing inline code");
            return match job.execution_type {
                ExecutionType::Class => self.class_executor.execute(job).await,
                ExecutionType::Function => self.function_executor.execute(job).await,
            };
        }

        debug!("flash deployment detected, checking execution path");
        let Some(registry) = &self.registry else {
            debug!("service registry not available, executing locally");
            return self.execute_flash_local(job).await;
        };

        let function_name = job.target().to_string();
        let manifest = match registry.load() {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(?err, "manifest unavailable, attempting local execution");
                return self.execute_flash_local(job).await;
            }
        };

        if registry.is_local(&manifest, &function_name) {
            debug!(%function_name, "executing locally (no refresh)");
            return self.execute_flash_local(job).await;
        }

        // Remote target: refresh the manifest first so we route against the
        // freshest endpoint table we can get. Refresh errors are non-fatal.
        debug!("remote function detected, refreshing manifest before routing");
        registry.refresh_if_stale(MANIFEST_TTL).await;

        let manifest = registry.load().unwrap_or(manifest);
        match registry.endpoint_url_for(&manifest, &function_name) {
            Some(endpoint_url) => {
                debug!(%function_name, %endpoint_url, "routing to remote endpoint");
                self.forward(job, &endpoint_url).await
            }
            None => {
                warn!(
                    %function_name,
                    "no endpoint URL after refresh, executing locally"
                );
                self.execute_flash_local(job).await
            }
        }
    }

    /// Execute a pre-deployed function from the local app directory.
    async fn execute_flash_local(&self, job: &Job) -> Response {
        let function_name = job.target().to_string();

        let manifest = match &self.registry {
            Some(registry) => match registry.load() {
                Ok(manifest) => manifest,
                Err(err) => {
                    return Response::err(format!(
                        "manifest not found; ensure build artifacts were unpacked correctly: {err:#}"
                    ));
                }
            },
            None => {
                return Response::err(format!(
                    "function '{function_name}' has no inline code and no manifest is available"
                ));
            }
        };

        let Some(entry) = manifest.function_entry(&function_name) else {
            return Response::err(format!(
                "function '{function_name}' not found in flash_manifest.json"
            ));
        };

        self.flash_executor.execute(job, entry).await
    }

    /// Forward the job to a sibling endpoint.
    async fn forward(&self, job: &Job, endpoint_url: &str) -> Response {
        let url = match Url::parse(endpoint_url) {
            Ok(url) => url,
            Err(err) => {
                return Response::err(format!(
                    "invalid endpoint URL '{endpoint_url}': {err}"
                ));
            }
        };

        let client = match Endpoint::new(url, Token::from_env("RUNPOD_API_KEY")) {
            Ok(client) => client,
            Err(err) => return Response::err(format!("failed to build endpoint client: {err:#}")),
        };

        match client.run(job).await {
            Ok(response) => response,
            Err(err) => Response::err(format!("failed to route to endpoint: {err:#}")),
        }
    }
}
