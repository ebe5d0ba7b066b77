//! HTTP surface integration: fixed routes plus dynamic class endpoints.

use axum_test::TestServer;
use pretty_assertions::assert_eq;

use flash_worker::server::{AppState, router};

use crate::{python_available, test_handler};

fn test_server() -> TestServer {
    TestServer::new(router(AppState::new(test_handler()))).unwrap()
}

#[tokio::test]
async fn execute_runs_a_live_function() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let server = test_server();

    let response = server
        .post("/execute")
        .json(&serde_json::json!({
            "input": {
                "function_name": "hello",
                "function_code": "def hello(): return 'hello world'"
            }
        }))
        .await;
    response.assert_status_ok();

    let body = response.json::<clients::flash::v1::Response>();
    assert!(body.success, "error: {:?}", body.error);
    assert_eq!(
        body.result.unwrap().to_json().unwrap(),
        serde_json::json!("hello world")
    );
}

const GREETER_CLASS: &str = "class Greeter:\n    def __init__(self):\n        self.calls = 0\n    @endpoint(route='/greet', methods=['POST', 'GET'])\n    def greet(self, name='world'):\n        self.calls += 1\n        return {'greeting': f'hello {name}', 'calls': self.calls}\n    def touch(self):\n        return self.calls\n";

#[tokio::test]
async fn class_execution_registers_endpoint_routes() {
    if !python_available().await {
        eprintln!("skipping: python3 not available");
        return;
    }
    let server = test_server();

    // Running the class through /execute registers its endpoint methods.
    let response = server
        .post("/execute")
        .json(&serde_json::json!({
            "input": {
                "execution_type": "class",
                "class_name": "Greeter",
                "class_code": GREETER_CLASS,
                "method_name": "touch"
            }
        }))
        .await;
    response.assert_status_ok();
    let body = response.json::<clients::flash::v1::Response>();
    assert!(body.success, "error: {:?}", body.error);

    // POST body becomes keyword arguments.
    let greeted = server
        .post("/greet")
        .json(&serde_json::json!({"name": "integration"}))
        .await;
    greeted.assert_status_ok();
    let value = greeted.json::<serde_json::Value>();
    assert_eq!(value["greeting"], "hello integration");
    assert_eq!(value["calls"], 1);

    // GET query string becomes keyword arguments, on the same instance.
    let greeted = server.get("/greet?name=again").await;
    greeted.assert_status_ok();
    let value = greeted.json::<serde_json::Value>();
    assert_eq!(value["greeting"], "hello again");
    assert_eq!(value["calls"], 2);
}

#[tokio::test]
async fn unregistered_route_stays_404_until_class_runs() {
    let server = test_server();
    let response = server.post("/greet").await;
    assert_eq!(response.status_code(), 404);
}
