//! Class method execution with instance reuse.

use std::sync::Arc;

use tracing::{debug, instrument};

use clients::flash::v1::{Blob, Job, Response};

use crate::{
    executor::registry::InstanceRegistry,
    shim::{ShimHost, ShimRequest},
};

/// Executes a method on a class instance, constructing or reusing the
/// instance per the job's `instance_id` / `create_new_instance` pair.
pub struct ClassExecutor {
    shim: Arc<ShimHost>,
    registry: InstanceRegistry,
}

impl ClassExecutor {
    pub fn new(shim: Arc<ShimHost>) -> Self {
        Self {
            shim,
            registry: InstanceRegistry::new(),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    #[instrument(skip_all, fields(class = job.target()))]
    pub async fn execute(&self, job: &Job) -> Response {
        let Some(class_name) = job.class_name.clone() else {
            return Response::err("class_name is required");
        };
        let method_name = job
            .method_name
            .clone()
            .unwrap_or_else(|| String::from("__call__"));

        // Reuse only when the caller both names an instance and asks for
        // reuse, and we actually know the id. An unknown id falls back to
        // constructing a new instance under that id.
        let generation = self.shim.generation();
        self.registry.sync_generation(generation);
        let (instance_id, construct) = match &job.instance_id {
            Some(id) if !job.create_new_instance && self.registry.contains(generation, id) => {
                debug!(instance_id = %id, "reusing existing instance");
                (id.clone(), false)
            }
            Some(id) => (id.clone(), true),
            None => (InstanceRegistry::generate_id(&class_name), true),
        };
        if construct {
            debug!(%instance_id, "creating new instance");
        }

        let request = ShimRequest::RunMethod {
            class_name: class_name.clone(),
            code: job.class_code.clone(),
            method_name,
            instance_id: instance_id.clone(),
            construct,
            constructor_args: job.constructor_args.clone(),
            constructor_kwargs: job.constructor_kwargs.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };

        let reply = match self.shim.call(&request).await {
            Ok(reply) => reply,
            Err(err) => return Response::err(format!("interpreter failure: {err:#}")),
        };

        if reply.ok {
            // Metadata is updated only on success; re-read the generation in
            // case the interpreter was respawned by this very call.
            let info =
                self.registry
                    .record_success(self.shim.generation(), &instance_id, &class_name);
            Response {
                success: true,
                result: Some(reply.result.unwrap_or_else(Blob::none)),
                stdout: Some(reply.stdout),
                instance_id: Some(instance_id),
                instance_info: Some(info),
                ..Response::default()
            }
        } else {
            let error = reply.error_message().to_string();
            Response::err_with_output(error, reply.stdout)
        }
    }
}
