//! API Server Module
//!
//! This module implements the JSON-RPC server through which callers queue,
//! withdraw and execute payments, plus the endpoint on which the gateway
//! posts output callbacks.

use super::rpc::{JsonRpcRequest, JsonRpcResponse};
use crate::{
    batch::{BatchingEngine, EngineSettings},
    config::Config,
    error::{codes, BatcherError, RpcError},
    gateway::GatewayRef,
    scheduler::Scheduler,
    types::{
        BatchSelector, DequeueAndPayParams, DequeueParams, ExecuteBatchParams,
        QueueForNextBatchParams, WebhookCallback,
    },
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Shared application state accessible from every handler
///
/// - `engine`: batching operations
/// - `scheduler`: restarted on configuration reload
/// - `gateway`: reconnected on configuration reload
/// - `config` / `config_path`: current configuration and where to reload it from
#[derive(Clone)]
pub struct AppState {
    engine: Arc<BatchingEngine>,
    scheduler: Arc<Scheduler>,
    gateway: GatewayRef,
    config: Arc<RwLock<Config>>,
    config_path: Arc<PathBuf>,
}

/// The main API server struct
pub struct Server {
    addr: String,
    webhooks_path: String,
    state: AppState,
}

impl Server {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        engine: Arc<BatchingEngine>,
        scheduler: Arc<Scheduler>,
        gateway: GatewayRef,
    ) -> Self {
        let addr = format!("{}:{}", config.api.host, config.api.port);
        let webhooks_path = config.api.webhooks_path.trim_start_matches('/').to_string();
        let state = AppState {
            engine,
            scheduler,
            gateway,
            config: Arc::new(RwLock::new(config)),
            config_path: Arc::new(config_path),
        };
        Self {
            addr,
            webhooks_path,
            state,
        }
    }

    /// Routes: `POST /api` for JSON-RPC and `POST /<webhooks_path>` for
    /// gateway callbacks. The webhook route is fixed at startup.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api", post(handle_rpc))
            .route(&format!("/{}", self.webhooks_path), post(handle_webhook))
            .with_state(self.state.clone())
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let app = self.router();
        info!("API server listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Main RPC request handler
///
/// Errors are answered with HTTP 400; the request params are attached as
/// error data unless the error already carries its own.
async fn handle_rpc(
    State(state): State<AppState>,
    payload: Result<Json<JsonRpcRequest>, JsonRejection>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Unparseable RPC request: {}", rejection);
            let error = RpcError::new(codes::PARSE_ERROR, rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::failure(Value::Null, error)));
        }
    };

    info!("RPC {} (id {})", request.method, request.id);
    match dispatch(&state, &request.method, request.params.clone()).await {
        Ok(result) => (StatusCode::OK, Json(JsonRpcResponse::success(request.id, result))),
        Err(mut error) => {
            debug!("RPC {} failed: {}", request.method, error);
            if error.data.is_none() {
                error.data = Some(request.params);
            }
            (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::failure(request.id, error)))
        }
    }
}

async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, RpcError> {
    let engine = &state.engine;
    match method {
        "queueForNextBatch" => {
            let params: QueueForNextBatchParams = parse_params(params)?;
            respond(engine.queue_for_next_batch(params).await)
        }
        "dequeueFromNextBatch" => {
            let params: DequeueParams = parse_params(params)?;
            respond(engine.dequeue_from_next_batch(params.batch_request_id).await)
        }
        "dequeueAndPay" => {
            let params: DequeueAndPayParams = parse_params(params)?;
            respond(engine.dequeue_and_pay(params).await)
        }
        "getBatchDetails" => {
            let selector: BatchSelector = parse_params(params)?;
            respond(engine.get_batch_details(selector).await)
        }
        "executeBatch" => {
            let params: ExecuteBatchParams = parse_params(params)?;
            respond(engine.execute_batch(params).await)
        }
        "getOngoingBatches" => respond(engine.get_ongoing_batches().await),
        "reloadConfig" => reload_config(state).await,
        "getConfig" => current_config(state).await,
        _ => Err(RpcError::new(codes::METHOD_NOT_FOUND, "No such method!")),
    }
}

/// Absent params are read as an empty object.
fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(codes::INVALID_PARAMS, format!("Invalid params: {}", e)))
}

fn respond<T: Serialize>(result: crate::error::Result<T>) -> Result<Value, RpcError> {
    let result = result.map_err(|e| e.to_rpc())?;
    serde_json::to_value(result).map_err(|e| RpcError::new(codes::INTERNAL_ERROR, e.to_string()))
}

async fn current_config(state: &AppState) -> Result<Value, RpcError> {
    let config = state.config.read().await;
    serde_json::to_value(&*config).map_err(|e| RpcError::new(codes::INTERNAL_ERROR, e.to_string()))
}

/// Re-read the configuration file and apply it to every component.
///
/// The listening address, webhook route and database are bound at startup
/// and keep their values until restart.
async fn reload_config(state: &AppState) -> Result<Value, RpcError> {
    let config = Config::load(state.config_path.as_path()).map_err(|e| {
        error!("Reloading {} failed: {:#}", state.config_path.display(), e);
        RpcError::new(codes::INTERNAL_ERROR, format!("Could not reload configuration: {}", e))
    })?;

    state
        .gateway
        .reconfigure(&config.gateway)
        .await
        .map_err(|e| BatcherError::from(e).to_rpc())?;
    state.engine.reconfigure(EngineSettings::from(&config)).await;
    state.scheduler.reconfigure(&config.batch);
    *state.config.write().await = config;

    info!("Configuration reloaded from {}", state.config_path.display());
    current_config(state).await
}

/// Gateway output callback handler
async fn handle_webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookCallback>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let callback = match payload {
        Ok(Json(callback)) => callback,
        Err(rejection) => {
            warn!("Unparseable webhook callback: {}", rejection);
            let error = RpcError::new(codes::PARSE_ERROR, rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": error })));
        }
    };

    info!("Webhook callback for output {}", callback.output_id);
    match state.engine.process_webhooks(callback).await {
        Ok(report) => (StatusCode::OK, Json(json!({ "result": report }))),
        Err(e) => {
            warn!("Webhook callback rejected: {}", e);
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_rpc() })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    fn config_toml(default_batcher_id: i64, timeout_minutes: u64) -> String {
        format!(
            r#"
[api]
host = "127.0.0.1"
port = 8000
public_url = "http://batcher"

[gateway]
url = "https://gatekeeper:2009/v0"
api_id = "003"
api_key = "topsecret"

[database]
url = "memory"

[batch]
default_batcher_id = {default_batcher_id}
timeout_minutes = {timeout_minutes}
check_threshold_minutes = 5
threshold_amount = 0.5
"#
        )
    }

    struct TestApp {
        h: Harness,
        router: Router,
        config_file: NamedTempFile,
    }

    fn app() -> TestApp {
        let h = harness();
        let mut config_file = NamedTempFile::new().unwrap();
        write!(config_file, "{}", config_toml(1, 60)).unwrap();
        let config = Config::load(config_file.path()).unwrap();

        let scheduler = Arc::new(Scheduler::new(h.engine.clone(), h.clock.clone()));
        let server = Server::new(
            config,
            config_file.path().to_path_buf(),
            h.engine.clone(),
            scheduler,
            h.gateway.clone(),
        );
        TestApp {
            router: server.router(),
            h,
            config_file,
        }
    }

    async fn post(router: &Router, uri: &str, body: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn call(router: &Router, method: &str, params: Value) -> (StatusCode, Value) {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        post(router, "/api", body.to_string()).await
    }

    #[tokio::test]
    async fn test_queue_and_get_details() {
        let app = app();

        let (status, body) = call(
            &app.router,
            "queueForNextBatch",
            json!({ "address": "bc1qapi", "amount": 0.001, "externalId": 12 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 1);
        let result = &body["result"];
        assert_eq!(result["batchId"], 1);
        assert_eq!(result["amount"], json!(0.001));
        assert_eq!(result["cnResult"]["batcherId"], 1);
        assert!(result["etaSeconds"].as_i64().unwrap() > 0);

        let (status, body) = call(&app.router, "getBatchDetails", json!({ "batchId": 1 })).await;
        assert_eq!(status, StatusCode::OK);
        let batch = &body["result"]["batch"];
        assert_eq!(batch["batchRequests"][0]["externalId"], "12");
        assert_eq!(batch["batchRequests"][0]["address"], "bc1qapi");
        assert!(body["result"]["etaSeconds"].is_i64());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let app = app();
        let (status, body) = call(&app.router, "mine", json!({ "x": 1 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::METHOD_NOT_FOUND);
        assert_eq!(body["error"]["data"], json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let app = app();
        let (status, body) = call(
            &app.router,
            "queueForNextBatch",
            json!({ "address": "bc1qapi", "amount": 0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::INVALID_REQUEST);
        assert_eq!(body["error"]["message"], "Invalid arguments");
        assert!(app.h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let app = app();
        let (status, body) = call(&app.router, "dequeueFromNextBatch", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let app = app();
        let (status, body) = post(&app.router, "/api", "{not json".into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::PARSE_ERROR);
        assert!(body["id"].is_null());
    }

    #[tokio::test]
    async fn test_execute_and_ongoing_batches() {
        let app = app();
        call(&app.router, "queueForNextBatch", json!({ "address": "bc1qa", "amount": 1 })).await;

        let (_, body) = call(&app.router, "getOngoingBatches", Value::Null).await;
        assert_eq!(body["result"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app.router, "executeBatch", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["batch"]["txid"], "batchtx1");
        assert_eq!(body["result"]["cnResult"]["txid"], "batchtx1");

        let (_, body) = call(&app.router, "getOngoingBatches", Value::Null).await;
        assert_eq!(body["result"], json!([]));

        let (status, body) = call(&app.router, "executeBatch", json!({ "batchId": 1 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "Batch already executed");
    }

    #[tokio::test]
    async fn test_get_config_hides_api_key() {
        let app = app();
        let (status, body) = call(&app.router, "getConfig", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["gateway"]["api_id"], "003");
        assert!(body["result"]["gateway"].get("api_key").is_none());
    }

    #[tokio::test]
    async fn test_reload_config_applies_new_settings() {
        let app = app();
        std::fs::write(app.config_file.path(), config_toml(2, 10)).unwrap();

        let (status, body) = call(&app.router, "reloadConfig", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["batch"]["default_batcher_id"], 2);
        assert_eq!(app.h.engine.settings().await.default_batcher_id, 2);
        let left = app.h.clock.time_left_secs();
        assert!(left > 590 && left <= 600);

        let (_, body) = call(&app.router, "queueForNextBatch", json!({ "address": "bc1qa", "amount": 1 })).await;
        assert_eq!(body["result"]["cnResult"]["batcherId"], 2);
    }

    #[tokio::test]
    async fn test_reload_with_broken_file_keeps_config() {
        let app = app();
        std::fs::write(app.config_file.path(), "[api").unwrap();

        let (status, body) = call(&app.router, "reloadConfig", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::INTERNAL_ERROR);
        assert_eq!(app.h.engine.settings().await.default_batcher_id, 1);
    }

    #[tokio::test]
    async fn test_webhook_endpoint_notifies_caller() {
        let app = app();
        let (_, body) = call(
            &app.router,
            "queueForNextBatch",
            json!({ "address": "bc1qa", "amount": 1, "webhookUrl": "http://caller/hook" }),
        )
        .await;
        let output_id = body["result"]["cnResult"]["outputId"].clone();

        let callback = json!({ "outputId": output_id, "status": "confirmed", "txid": "abc" });
        let (status, body) = post(&app.router, "/webhooks", callback.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["notified"], json!([1]));

        let delivered = app.h.notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "http://caller/hook");

        let (status, body) = post(&app.router, "/webhooks", json!({ "outputId": 999 }).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], codes::INVALID_PARAMS);
    }
}
