//! Execution of user code through the interpreter host.
//!
//! Three executors share the shim: inline functions, class methods with a
//! persistent instance registry, and pre-deployed (Flash) functions invoked
//! by module import.

use clients::flash::v1::{Blob, Response};

use crate::shim::ShimReply;

mod class;
mod flash;
mod function;
mod registry;

pub use class::ClassExecutor;
pub use flash::FlashExecutor;
pub use function::FunctionExecutor;
pub use registry::InstanceRegistry;

/// Shape a shim reply into a response, with no instance bookkeeping.
fn reply_into_response(reply: ShimReply) -> Response {
    if reply.ok {
        Response {
            success: true,
            result: Some(reply.result.unwrap_or_else(Blob::none)),
            stdout: Some(reply.stdout),
            ..Response::default()
        }
    } else {
        let error = reply.error_message().to_string();
        Response::err_with_output(error, reply.stdout)
    }
}
