//! End-to-end job execution through the handler and interpreter.

use clients::flash::v1::{Blob, ExecutionType, Job};
use pretty_assertions::assert_eq;

use crate::{function_job, python_available, test_handler};

#[tokio::test]
async fn simple_live_function_returns_its_value() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = function_job("hello", "def hello(): return 'hello world'", &[]);
    let response = handler.handle(&job).await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(
        response.result.unwrap().to_json().unwrap(),
        serde_json::json!("hello world")
    );
    assert_eq!(response.error, None);
}

#[tokio::test]
async fn function_with_args_computes() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = function_job(
        "add",
        "def add(a,b): return a+b",
        &[serde_json::json!(5), serde_json::json!(3)],
    );
    let response = handler.handle(&job).await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(
        response.result.unwrap().to_json().unwrap(),
        serde_json::json!(8)
    );
}

#[tokio::test]
async fn function_with_kwargs_computes() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let mut job = function_job("greet", "def greet(name='x'): return f'hi {name}'", &[]);
    job.kwargs.insert(
        String::from("name"),
        Blob::from_json(&serde_json::json!("worker")).unwrap(),
    );
    let response = handler.handle(&job).await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(
        response.result.unwrap().to_json().unwrap(),
        serde_json::json!("hi worker")
    );
}

#[tokio::test]
async fn async_functions_are_awaited() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = function_job(
        "hello",
        "import asyncio\nasync def hello():\n    await asyncio.sleep(0)\n    return 'async hi'",
        &[],
    );
    let response = handler.handle(&job).await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(
        response.result.unwrap().to_json().unwrap(),
        serde_json::json!("async hi")
    );
}

#[tokio::test]
async fn raising_function_reports_type_message_and_stack() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = function_job("err", "def err(): raise ValueError('boom')", &[]);
    let response = handler.handle(&job).await;

    assert!(!response.success);
    assert!(response.result.is_none());
    let error = response.error.unwrap();
    assert!(error.contains("boom"), "error: {error}");
    assert!(error.contains("ValueError"), "error: {error}");
    assert!(error.contains("Traceback"), "error: {error}");
}

#[tokio::test]
async fn function_printing_captures_stdout() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = function_job(
        "noisy",
        "def noisy():\n    print('working on it')\n    return 1",
        &[],
    );
    let response = handler.handle(&job).await;

    assert!(response.success, "error: {:?}", response.error);
    assert!(response.stdout.unwrap().contains("working on it"));
}

#[tokio::test]
async fn missing_function_name_in_code_is_an_error() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = function_job("missing", "def other(): return 1", &[]);
    let response = handler.handle(&job).await;

    assert!(!response.success);
    assert!(
        response
            .error
            .unwrap()
            .contains("not found in the provided code")
    );
}

const COUNTER_CLASS: &str =
    "class Counter:\n    def __init__(self):\n        self.n = 0\n    def inc(self):\n        self.n += 1\n        return self.n\n";

#[tokio::test]
async fn class_construct_then_reuse_preserves_state() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let first_job = Job {
        execution_type: ExecutionType::Class,
        class_name: Some(String::from("Counter")),
        class_code: Some(String::from(COUNTER_CLASS)),
        method_name: Some(String::from("inc")),
        ..Job::default()
    };
    let first = handler.handle(&first_job).await;
    assert!(first.success, "error: {:?}", first.error);
    assert_eq!(
        first.result.unwrap().to_json().unwrap(),
        serde_json::json!(1)
    );
    let instance_id = first.instance_id.unwrap();
    assert!(instance_id.starts_with("Counter_"));
    assert_eq!(first.instance_info.as_ref().unwrap().method_calls, 1);

    // Second call reuses the instance without re-sending the source.
    let second_job = Job {
        execution_type: ExecutionType::Class,
        class_name: Some(String::from("Counter")),
        method_name: Some(String::from("inc")),
        instance_id: Some(instance_id.clone()),
        create_new_instance: false,
        ..Job::default()
    };
    let second = handler.handle(&second_job).await;
    assert!(second.success, "error: {:?}", second.error);
    assert_eq!(
        second.result.unwrap().to_json().unwrap(),
        serde_json::json!(2)
    );
    assert_eq!(second.instance_id.unwrap(), instance_id);
    assert_eq!(second.instance_info.unwrap().method_calls, 2);
}

#[tokio::test]
async fn missing_method_is_reported_as_not_found() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let job = Job {
        execution_type: ExecutionType::Class,
        class_name: Some(String::from("Counter")),
        class_code: Some(String::from(COUNTER_CLASS)),
        method_name: Some(String::from("absent")),
        ..Job::default()
    };
    let response = handler.handle(&job).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert!(error.contains("not found in class"), "error: {error}");
}

#[tokio::test]
async fn user_defined_values_round_trip_as_opaque_blobs() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    // A dataclass-free custom type: JSON cannot carry it, so the shim falls
    // back to pickle and the worker passes the blob through untouched.
    let make = function_job(
        "make",
        "class Point:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\ndef make():\n    return Point(3, 4)",
        &[],
    );
    let made = handler.handle(&make).await;
    assert!(made.success, "error: {:?}", made.error);
    let point = made.result.unwrap();
    assert!(point.to_json().is_err(), "expected an opaque pickle blob");

    let read = Job {
        function_name: Some(String::from("norm2")),
        function_code: Some(String::from(
            "def norm2(p): return p.x * p.x + p.y * p.y",
        )),
        args: vec![point],
        ..Job::default()
    };
    let normed = handler.handle(&read).await;
    assert!(normed.success, "error: {:?}", normed.error);
    assert_eq!(
        normed.result.unwrap().to_json().unwrap(),
        serde_json::json!(25)
    );
}

#[tokio::test]
async fn envelope_parsing_tolerates_wrapped_and_direct_shapes() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let wrapped = serde_json::json!({
        "input": {
            "function_name": "hello",
            "function_code": "def hello(): return 'hello world'",
            "args": [],
            "kwargs": {}
        }
    });
    let response = handler.handle_envelope(wrapped).await;
    assert!(response.success, "error: {:?}", response.error);

    let direct = serde_json::json!({
        "function_name": "hello",
        "function_code": "def hello(): return 'hello world'"
    });
    let response = handler.handle_envelope(direct).await;
    assert!(response.success, "error: {:?}", response.error);
}

#[tokio::test]
async fn response_populates_exactly_one_of_result_and_error() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let handler = test_handler();

    let ok = handler
        .handle(&function_job("f", "def f(): return 0", &[]))
        .await;
    assert!(ok.success && ok.result.is_some() && ok.error.is_none());

    let err = handler
        .handle(&function_job("f", "def f(): raise RuntimeError('x')", &[]))
        .await;
    assert!(!err.success && err.result.is_none() && err.error.is_some());
}
