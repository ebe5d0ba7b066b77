//! The optional HTTP surface, for running the worker as a server instead of
//! under the serverless host.
//!
//! Besides the fixed routes (`/health`, `/ping`, `/execute`), class methods
//! annotated with the `endpoint` marker get routes registered dynamically
//! when their class first executes. Those land in a route table consulted
//! by the fallback handler: a GET's query string or a POST's JSON body
//! becomes the method's keyword arguments, and the method's return value
//! comes back as plain JSON.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
};
use dashmap::DashMap;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, instrument, warn};

use clients::flash::v1::{Blob, ExecutionType, Job, Response};

use crate::{handler::Handler, shim::ShimRequest};

/// Where a dynamically registered route dispatches to.
#[derive(Clone, Debug)]
struct RouteTarget {
    class_name: String,
    method_name: String,
}

/// Shared server state.
pub struct AppState {
    handler: Handler,
    routes: DashMap<(Method, String), RouteTarget>,
}

impl AppState {
    pub fn new(handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            routes: DashMap::new(),
        })
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/execute", post(execute))
        .fallback(dynamic_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ping": "pong"}))
}

/// Execute a job from the request body (wrapped or direct shape).
#[instrument(skip_all)]
async fn execute(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Json<Response> {
    let response = state.handler.handle_envelope(payload.clone()).await;

    // A live class that just ran successfully may expose endpoint-marked
    // methods; register them so subsequent HTTP calls can reach them.
    if response.success {
        if let Some(job) = parse_job(&payload) {
            if job.execution_type == ExecutionType::Class && job.class_code.is_some() {
                register_class_routes(&state, &job).await;
            }
        }
    }

    Json(response)
}

fn parse_job(payload: &serde_json::Value) -> Option<Job> {
    let input = payload.get("input").unwrap_or(payload);
    serde_json::from_value(input.clone()).ok()
}

/// Discover the class's endpoint-marked methods and add them to the route
/// table. Failures only cost HTTP exposure, never the job.
async fn register_class_routes(state: &Arc<AppState>, job: &Job) {
    let Some(class_name) = job.class_name.clone() else {
        return;
    };
    let request = ShimRequest::DescribeClass {
        class_name: class_name.clone(),
        code: job.class_code.clone(),
    };
    let reply = match state.handler.shim().call(&request).await {
        Ok(reply) if reply.ok => reply,
        Ok(reply) => {
            warn!(%class_name, error = reply.error_message(), "endpoint discovery failed");
            return;
        }
        Err(err) => {
            warn!(%class_name, ?err, "endpoint discovery failed");
            return;
        }
    };

    for spec in reply.endpoints.unwrap_or_default() {
        for http_method in &spec.http_methods {
            let Ok(method) = http_method.parse::<Method>() else {
                warn!(%http_method, "skipping endpoint with unknown HTTP method");
                continue;
            };
            debug!(
                %class_name,
                method = %spec.method_name,
                route = %spec.route,
                %http_method,
                "registered HTTP endpoint"
            );
            state.routes.insert(
                (method, spec.route.clone()),
                RouteTarget {
                    class_name: class_name.clone(),
                    method_name: spec.method_name.clone(),
                },
            );
        }
    }
}

/// Serve dynamically registered class-method routes.
#[instrument(skip_all, fields(method = %request.method(), path = request.uri().path()))]
async fn dynamic_route(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> HttpResponse {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let Some(target) = state
        .routes
        .get(&(method.clone(), path.clone()))
        .map(|entry| entry.value().clone())
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"detail": "not found"})),
        )
            .into_response();
    };

    let kwargs = match request_kwargs(request).await {
        Ok(kwargs) => kwargs,
        Err(detail) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"detail": detail})),
            )
                .into_response();
        }
    };

    // Endpoint calls share one long-lived instance per class; reuse it on
    // every call rather than constructing per request.
    let job = Job {
        execution_type: ExecutionType::Class,
        class_name: Some(target.class_name.clone()),
        method_name: Some(target.method_name.clone()),
        instance_id: Some(format!("{}_default", target.class_name)),
        create_new_instance: false,
        kwargs,
        ..Job::default()
    };

    let response = state.handler.router().class_executor().execute(&job).await;
    if !response.success {
        error!(
            class = %target.class_name,
            method = %target.method_name,
            error = response.error.as_deref().unwrap_or("unknown"),
            "endpoint method failed"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "detail": format!(
                    "method execution failed: {}",
                    response.error.unwrap_or_default()
                )
            })),
        )
            .into_response();
    }

    match response.result.as_ref().map(Blob::to_json) {
        Some(Ok(value)) => Json(value).into_response(),
        Some(Err(err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "detail": format!("result is not JSON-serializable: {err}")
            })),
        )
            .into_response(),
        None => Json(serde_json::Value::Null).into_response(),
    }
}

/// Turn the request into keyword-argument blobs: query pairs for GET,
/// the JSON object body for everything else.
async fn request_kwargs(
    request: Request<Body>,
) -> Result<std::collections::BTreeMap<String, Blob>, String> {
    let mut kwargs = std::collections::BTreeMap::new();

    if request.method() == Method::GET {
        let query = request.uri().query().unwrap_or_default().to_string();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let blob = Blob::from_json(&serde_json::Value::String(value.into_owned()))
                .map_err(|err| format!("encode query argument '{name}': {err}"))?;
            kwargs.insert(name.into_owned(), blob);
        }
        return Ok(kwargs);
    }

    let body = axum::body::to_bytes(request.into_body(), 64 * 1024 * 1024)
        .await
        .map_err(|err| format!("read request body: {err}"))?;
    if body.is_empty() {
        return Ok(kwargs);
    }

    let parsed = serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|err| format!("parse request body: {err}"))?;
    let serde_json::Value::Object(fields) = parsed else {
        return Err(String::from("request body must be a JSON object"));
    };
    for (name, value) in fields {
        let blob =
            Blob::from_json(&value).map_err(|err| format!("encode argument '{name}': {err}"))?;
        kwargs.insert(name, blob);
    }
    Ok(kwargs)
}

#[cfg(test)]
mod tests {
    use axum_test::TestServer;
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_server() -> TestServer {
        let state = AppState::new(Handler::new());
        TestServer::new(router(state)).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let server = test_server();
        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_json(&serde_json::json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn ping_pongs() {
        let server = test_server();
        let response = server.get("/ping").await;
        response.assert_status_ok();
        response.assert_json(&serde_json::json!({"ping": "pong"}));
    }

    #[tokio::test]
    async fn execute_rejects_malformed_jobs_with_a_failure_response() {
        let server = test_server();
        let response = server
            .post("/execute")
            .json(&serde_json::json!({"input": {"execution_type": "not-a-type"}}))
            .await;
        response.assert_status_ok();

        let body = response.json::<Response>();
        assert!(!body.success);
        assert!(body.error.unwrap().contains("malformed job envelope"));
    }

    #[tokio::test]
    async fn execute_accepts_the_direct_job_shape() {
        let server = test_server();
        // No function_name: the validation failure proves the direct shape
        // parsed as a job rather than being rejected as an envelope.
        let response = server
            .post("/execute")
            .json(&serde_json::json!({"args": []}))
            .await;
        response.assert_status_ok();

        let body = response.json::<Response>();
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("function_name is required"));
    }

    #[tokio::test]
    async fn unregistered_dynamic_route_is_404() {
        let server = test_server();
        let response = server.post("/predict").await;
        response.assert_status(StatusCode::NOT_FOUND);
    }
}
