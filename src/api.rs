//! HTTP API over the execution service
//!
//! Routes:
//! - `POST /v1/execute`     run one request
//! - `POST /v1/batch`       run a list of requests, results in input order
//! - `GET  /v1/health`      health monitor status
//! - `GET  /v1/metrics`     metrics snapshot
//! - `GET  /v1/pool`        pool, processor and cache status
//! - `POST /v1/pool/scale`  explicit scale up/down

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::health::ComponentHealth;
use crate::metrics::MetricsSnapshot;
use crate::pool::{InstanceId, PoolStatus};
use crate::sandbox::{ExecutionRequest, ExecutionResult};
use crate::service::{ScalableSandboxService, ServiceStatus};

type AppState = Arc<ScalableSandboxService>;

// ---- Error Handling ----

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Option<Uuid>,
    pub retryable: bool,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        ErrorBody {
            kind: err.kind(),
            message: err.untagged().to_string(),
            correlation_id: err.correlation_id(),
            retryable: err.is_retryable(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NoAvailableInstance | ErrorKind::CircuitOpen | ErrorKind::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Execution => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

// ---- Response Types ----

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScaleRequest {
    #[serde(default)]
    pub up: Option<usize>,
    #[serde(default)]
    pub down: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ScaleResponse {
    added: Vec<InstanceId>,
    removed: usize,
    pool: PoolStatus,
}

// ---- Handlers ----

async fn execute(
    State(service): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> std::result::Result<Json<ExecutionResult>, ApiError> {
    Ok(Json(service.execute(request).await?))
}

async fn execute_batch(
    State(service): State<AppState>,
    Json(requests): Json<Vec<ExecutionRequest>>,
) -> Json<Vec<BatchItem>> {
    let batch = service.execute_batch(requests).await;
    let items = batch
        .results
        .iter()
        .map(|result| match result {
            Ok(r) => BatchItem {
                ok: true,
                result: Some(r.clone()),
                error: None,
            },
            Err(e) => BatchItem {
                ok: false,
                result: None,
                error: Some(ErrorBody::from(e)),
            },
        })
        .collect();
    Json(items)
}

async fn health(State(service): State<AppState>) -> Json<HealthResponse> {
    let components = service.health();
    Json(HealthResponse {
        healthy: components.values().all(|c| c.healthy),
        components,
    })
}

async fn metrics(State(service): State<AppState>) -> Json<MetricsSnapshot> {
    Json(service.metrics())
}

async fn pool_status(State(service): State<AppState>) -> Json<ServiceStatus> {
    Json(service.status())
}

async fn scale(
    State(service): State<AppState>,
    Json(request): Json<ScaleRequest>,
) -> std::result::Result<Json<ScaleResponse>, ApiError> {
    if request.up.is_some() && request.down.is_some() {
        return Err(Error::Validation("give either `up` or `down`, not both".to_string()).into());
    }
    let added = request.up.map(|n| service.scale_up(n)).unwrap_or_default();
    let removed = request.down.map(|n| service.scale_down(n)).unwrap_or(0);
    Ok(Json(ScaleResponse {
        added,
        removed,
        pool: service.pool_status(),
    }))
}

// ---- Router ----

/// Build the API router
pub fn build_router(service: Arc<ScalableSandboxService>) -> Router {
    let v1 = Router::new()
        .route("/execute", post(execute))
        .route("/batch", post(execute_batch))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/pool", get(pool_status))
        .route("/pool/scale", post(scale));

    Router::new().nest("/v1", v1).with_state(service)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(service: Arc<ScalableSandboxService>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on http://{}", addr);

    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::sandbox::{Scripted, ScriptedBackend};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(backend: ScriptedBackend) -> (Router, AppState) {
        let mut config = ServiceConfig::default();
        config.pool.initial_workers = 2;
        config.execution.retry_limit = 0;
        let service = Arc::new(ScalableSandboxService::new(config, Arc::new(backend)).unwrap());
        (build_router(service.clone()), service)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let (app, _) = app(ScriptedBackend::echo());
        let (status, body) = call(
            app,
            "POST",
            "/v1/execute",
            Some(serde_json::json!({"code": "print('hi')", "language": "python"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["stdout"], "print('hi')");
        assert_eq!(body["cache_hit"], false);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (app, _) = app(ScriptedBackend::new(|_, _| Scripted::Fail {
            exit_code: 2,
            stderr: "NameError".into(),
        }));

        let (status, body) = call(
            app.clone(),
            "POST",
            "/v1/execute",
            Some(serde_json::json!({"code": "  ", "language": "python"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["retryable"], false);
        assert!(body["correlation_id"].is_string());

        let (status, body) = call(
            app,
            "POST",
            "/v1/execute",
            Some(serde_json::json!({"code": "oops", "language": "python"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "execution");
        assert!(body["message"].as_str().unwrap().contains("NameError"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(ErrorKind::QueueFull), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::CircuitOpen), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Sandbox), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_batch_keeps_order() {
        let (app, _) = app(ScriptedBackend::new(|_, request| {
            if request.code == "bad" {
                Scripted::Fail {
                    exit_code: 1,
                    stderr: "bad".into(),
                }
            } else {
                Scripted::Succeed(request.code.clone())
            }
        }));
        let (status, body) = call(
            app,
            "POST",
            "/v1/batch",
            Some(serde_json::json!([
                {"code": "a", "language": "bash"},
                {"code": "bad", "language": "bash"},
                {"code": "c", "language": "bash"}
            ])),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["result"]["stdout"], "a");
        assert_eq!(items[1]["ok"], false);
        assert_eq!(items[1]["error"]["kind"], "execution");
        assert_eq!(items[2]["result"]["stdout"], "c");
    }

    #[tokio::test]
    async fn test_observability_routes() {
        let (app, _) = app(ScriptedBackend::echo());

        let (status, body) = call(app.clone(), "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["components"].as_object().unwrap().len(), 2);

        let (status, body) = call(app.clone(), "GET", "/v1/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);

        let (status, body) = call(app, "GET", "/v1/pool", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pool"]["total"], 2);
        assert_eq!(body["strategy"], "least_connections");
    }

    #[tokio::test]
    async fn test_scale_route() {
        let (app, service) = app(ScriptedBackend::echo());
        let (status, body) = call(
            app.clone(),
            "POST",
            "/v1/pool/scale",
            Some(serde_json::json!({"up": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"].as_array().unwrap().len(), 2);
        assert_eq!(service.pool_status().total, 4);

        let (status, _) = call(
            app,
            "POST",
            "/v1/pool/scale",
            Some(serde_json::json!({"up": 1, "down": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
