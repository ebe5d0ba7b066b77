//! Pre-deployed (Flash) function execution.

use std::sync::Arc;

use tracing::{debug, instrument};

use clients::flash::v1::{Job, Response, manifest::FunctionEntry};

use crate::{
    executor::reply_into_response,
    shim::{ShimHost, ShimRequest},
};

/// Executes a pre-deployed function by importing its declared module and
/// calling the named attribute.
pub struct FlashExecutor {
    shim: Arc<ShimHost>,
}

impl FlashExecutor {
    pub fn new(shim: Arc<ShimHost>) -> Self {
        Self { shim }
    }

    #[instrument(skip_all, fields(function = entry.name.as_str(), module = entry.module.as_str()))]
    pub async fn execute(&self, job: &Job, entry: &FunctionEntry) -> Response {
        debug!("importing deployed function");

        let request = ShimRequest::CallDeployed {
            module: entry.module.clone(),
            name: entry.name.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };

        match self.shim.call(&request).await {
            Ok(reply) if reply.ok => reply_into_response(reply),
            Ok(reply) => Response::err_with_output(
                format!(
                    "failed to execute Flash function '{}': {}",
                    entry.name,
                    reply.error_message()
                ),
                reply.stdout,
            ),
            Err(err) => Response::err(format!(
                "failed to execute Flash function '{}': {err:#}",
                entry.name
            )),
        }
    }
}
