use super::token::TokenSigner;
use super::{
    AddToBatchRequest, AddToBatchResult, BatchSpendRequest, BatchSpendResult, GatewayError,
    GatewayResult, PaymentGateway, SpendRequest, SpendResult,
};
use crate::config::GatewayConfig;
use crate::error::{codes, RpcError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Connection state replaced wholesale on reconfiguration.
#[derive(Clone)]
struct Connection {
    http: reqwest::Client,
    base_url: String,
    signer: TokenSigner,
}

impl Connection {
    fn build(config: &GatewayConfig) -> GatewayResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout());

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| GatewayError::Config(format!("reading {}: {}", ca_file, e)))?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| GatewayError::Config(format!("parsing {}: {}", ca_file, e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        let http = builder
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            signer: TokenSigner::new(&config.api_id, &config.api_key),
        })
    }
}

/// `{ result }` / `{ error }` body returned by most gateway endpoints.
#[derive(Deserialize)]
struct Envelope<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct PlainFailure {
    message: Option<String>,
}

/// HTTP client for the wallet gateway
///
/// Every call is a POST authenticated by a freshly signed bearer token.
/// Failures are classified so callers can tell a gateway-side rejection from
/// an unreachable gateway.
pub struct GatewayClient {
    connection: RwLock<Connection>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        info!("Gateway client targeting {}", config.url);
        Ok(Self {
            connection: RwLock::new(Connection::build(config)?),
        })
    }

    /// POST `body` to `path` and return the status with the raw body.
    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> GatewayResult<(u16, String)> {
        let connection = self.connection.read().await.clone();
        let url = format!("{}/{}", connection.base_url, path);
        let token = connection
            .signer
            .sign()
            .map_err(|e| GatewayError::Config(format!("signing token: {}", e)))?;

        debug!("POST {}", url);
        let response = connection
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!("Gateway call {} failed: {}", path, e);
                GatewayError::Unavailable(e.to_string())
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        debug!("Gateway {} answered {}: {}", path, status, text);
        Ok((status, text))
    }

    /// Call an endpoint answering with a `{ result }` / `{ error }` envelope.
    async fn call<B, R>(&self, path: &str, body: &B) -> GatewayResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let (status, text) = self.post(path, body).await?;
        parse_envelope(status, &text)
    }
}

fn is_success(status: u16) -> bool {
    (200..400).contains(&status)
}

fn parse_envelope<R: DeserializeOwned>(status: u16, text: &str) -> GatewayResult<R> {
    let envelope: Envelope<R> = serde_json::from_str(text)
        .map_err(|e| GatewayError::Malformed(format!("HTTP {}: {}", status, e)))?;

    match (envelope.result, envelope.error) {
        (_, Some(error)) => Err(GatewayError::Rejected(error)),
        (Some(result), None) if is_success(status) => Ok(result),
        _ => Err(GatewayError::Malformed(format!("HTTP {} without result", status))),
    }
}

fn parse_spend(status: u16, text: &str) -> GatewayResult<SpendResult> {
    if is_success(status) {
        return serde_json::from_str(text)
            .map_err(|e| GatewayError::Malformed(format!("HTTP {}: {}", status, e)));
    }
    let message = serde_json::from_str::<PlainFailure>(text)
        .ok()
        .and_then(|f| f.message)
        .unwrap_or_else(|| format!("HTTP {}", status));
    Err(GatewayError::Rejected(RpcError::new(codes::INTERNAL_ERROR, message)))
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn add_to_batch(&self, request: AddToBatchRequest) -> GatewayResult<AddToBatchResult> {
        self.call("addtobatch", &request).await
    }

    async fn remove_from_batch(&self, output_id: i64) -> GatewayResult<AddToBatchResult> {
        self.call("removefrombatch", &json!({ "outputId": output_id })).await
    }

    async fn batch_spend(&self, request: BatchSpendRequest) -> GatewayResult<BatchSpendResult> {
        self.call("batchspend", &request).await
    }

    async fn spend(&self, request: SpendRequest) -> GatewayResult<SpendResult> {
        let (status, text) = self.post("spend", &request).await?;
        parse_spend(status, &text)
    }

    async fn reconfigure(&self, config: &GatewayConfig) -> GatewayResult<()> {
        let connection = Connection::build(config)?;
        *self.connection.write().await = connection;
        info!("Gateway client reconfigured for {}", config.url);
        Ok(())
    }
}
