//! Flash worker v1 wire types and client.
//!
//! A [`Job`] describes one invocation of the worker: either *live* (the job
//! carries inline source) or *Flash* (the code was pre-deployed and the job
//! only names the function). The worker always answers with a [`Response`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod blob;
pub mod manifest;

#[cfg(feature = "client")]
mod client;

pub use blob::Blob;
pub use manifest::Manifest;

#[cfg(feature = "client")]
pub use client::{Endpoint, StateManager};

/// Total deadline for a forwarded cross-endpoint request, in seconds.
pub const ENDPOINT_TIMEOUT_SECS: u64 = 300;

/// What kind of callable the job targets.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    #[default]
    Function,
    Class,
}

/// One invocation of the worker.
///
/// Unknown fields are tolerated on deserialization so that newer clients can
/// talk to older workers. All fields are defaulted: a missing field is never
/// a deserialization error, only (possibly) a validation error later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub execution_type: ExecutionType,

    /// Target function name; required when `execution_type` is `function`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,

    /// Inline function source. Absence selects pre-deployed (Flash) mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_code: Option<String>,

    /// Target class name; required when `execution_type` is `class`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Inline class source. Absence selects pre-deployed (Flash) mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_code: Option<String>,

    /// Method to dispatch on the class instance; defaults to `__call__`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,

    pub args: Vec<Blob>,
    pub kwargs: BTreeMap<String, Blob>,

    pub constructor_args: Vec<Blob>,
    pub constructor_kwargs: BTreeMap<String, Blob>,

    /// Requests reuse of an existing instance when paired with
    /// `create_new_instance = false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default = "default_true")]
    pub create_new_instance: bool,

    /// Language package specifiers (`name` or `name==version`), in order.
    pub dependencies: Vec<String>,

    /// OS package names, in order.
    pub system_dependencies: Vec<String>,

    #[serde(default = "default_true")]
    pub accelerate_downloads: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Job {
    fn default() -> Self {
        Self {
            execution_type: ExecutionType::default(),
            function_name: None,
            function_code: None,
            class_name: None,
            class_code: None,
            method_name: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            constructor_args: Vec::new(),
            constructor_kwargs: BTreeMap::new(),
            instance_id: None,
            create_new_instance: true,
            dependencies: Vec::new(),
            system_dependencies: Vec::new(),
            accelerate_downloads: true,
        }
    }
}

impl Job {
    /// Whether the job carries inline source (live mode) as opposed to
    /// referencing pre-deployed code (Flash mode).
    pub fn is_live(&self) -> bool {
        self.function_code.is_some() || self.class_code.is_some()
    }

    /// The name of the callable the job targets, for diagnostics.
    pub fn target(&self) -> &str {
        match self.execution_type {
            ExecutionType::Function => self.function_name.as_deref().unwrap_or("<unnamed>"),
            ExecutionType::Class => self.class_name.as_deref().unwrap_or("<unnamed>"),
        }
    }
}

/// The ingress envelope: `{"input": <Job>}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub input: Job,
}

/// Metadata about a live class instance, echoed back in responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub class_name: String,
    pub instance_id: String,
    pub created_at: String,
    pub method_calls: u64,
    pub last_used: String,
}

/// The worker's answer to a [`Job`].
///
/// Exactly one of `result` and `error` is meaningful, and `success` tells
/// which. `stdout` is best-effort and carries captured output and log lines
/// regardless of outcome.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Blob>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_info: Option<InstanceInfo>,
}

impl Response {
    /// A successful response with an optional captured output.
    pub fn ok(result: Blob, stdout: impl Into<Option<String>>) -> Self {
        Self {
            success: true,
            result: Some(result),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A successful response that carries only captured output.
    pub fn ok_output(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: Some(stdout.into()),
            ..Self::default()
        }
    }

    /// A failed response.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// A failed response that also carries captured output.
    pub fn err_with_output(error: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            stdout: Some(stdout.into()),
            ..Self::default()
        }
    }

    /// Append captured log lines to the response's `stdout`, preserving any
    /// output already present.
    pub fn prepend_logs(mut self, logs: &str) -> Self {
        if logs.is_empty() {
            return self;
        }
        self.stdout = match self.stdout.take() {
            Some(existing) if !existing.is_empty() => Some(format!("{logs}\n\n{existing}")),
            _ => Some(logs.to_string()),
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn job_tolerates_unknown_fields() {
        let job = serde_json::from_str::<Job>(
            r#"{"function_name": "hello", "function_code": "def hello(): pass", "some_future_field": 42}"#,
        )
        .unwrap();
        assert_eq!(job.function_name.as_deref(), Some("hello"));
        assert!(job.is_live());
        assert!(job.create_new_instance);
        assert!(job.accelerate_downloads);
    }

    #[test]
    fn job_defaults() {
        let job = serde_json::from_str::<Job>("{}").unwrap();
        assert_eq!(job.execution_type, ExecutionType::Function);
        assert!(!job.is_live());
        assert!(job.args.is_empty());
        assert!(job.dependencies.is_empty());
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = JobEnvelope {
            input: Job {
                function_name: Some("add".into()),
                ..Job::default()
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back = serde_json::from_str::<JobEnvelope>(&json).unwrap();
        assert_eq!(envelope, back);
    }

    #[test]
    fn response_omits_absent_fields() {
        let response = Response::err("boom");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn execution_type_wire_names() {
        assert_eq!(
            serde_json::from_str::<ExecutionType>(r#""class""#).unwrap(),
            ExecutionType::Class,
        );
        assert_eq!(
            serde_json::to_string(&ExecutionType::Function).unwrap(),
            r#""function""#,
        );
    }
}
