//! Inline function execution.

use std::sync::Arc;

use tracing::instrument;

use clients::flash::v1::{Job, Response};

use crate::{
    executor::reply_into_response,
    shim::{ShimHost, ShimRequest},
};

/// Executes inline function source against deserialized arguments,
/// capturing all output.
pub struct FunctionExecutor {
    shim: Arc<ShimHost>,
}

impl FunctionExecutor {
    pub fn new(shim: Arc<ShimHost>) -> Self {
        Self { shim }
    }

    #[instrument(skip_all, fields(function = job.target()))]
    pub async fn execute(&self, job: &Job) -> Response {
        let Some(function_name) = job.function_name.clone() else {
            return Response::err("function_name is required");
        };
        let Some(code) = job.function_code.clone() else {
            return Response::err(format!(
                "no inline code provided for function '{function_name}'"
            ));
        };

        let request = ShimRequest::RunFunction {
            function_name,
            code,
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };

        match self.shim.call(&request).await {
            Ok(reply) => reply_into_response(reply),
            Err(err) => Response::err(format!("interpreter failure: {err:#}")),
        }
    }
}
