//! Shared test helpers.

use clients::flash::v1::{Blob, Job};
use flash_worker::{handler::Handler, subprocess};

/// Whether the auxiliary interpreter is available on this machine.
pub async fn python_available() -> bool {
    subprocess::which("python3").await
}

/// A handler over the detected (container) layout.
pub fn test_handler() -> Handler {
    Handler::new()
}

/// A live function job with JSON-encoded positional arguments.
pub fn function_job(name: &str, code: &str, args: &[serde_json::Value]) -> Job {
    Job {
        function_name: Some(name.to_string()),
        function_code: Some(code.to_string()),
        args: args.iter().map(|v| Blob::from_json(v).unwrap()).collect(),
        ..Job::default()
    }
}
