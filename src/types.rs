use crate::error::RpcError;
use crate::gateway::{AddToBatchResult, BatchSpendResult, SpendResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A pending or executed batch, mirroring one gateway batcher run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: i64,
    pub cn_batcher_id: i64,
    pub txid: Option<String>,
    pub spent_details: Option<String>,
    pub spent_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// A batch with a transaction id has been broadcast and can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.txid.is_some()
    }
}

/// A single caller request to pay `amount` to `address` in the next batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub batch_request_id: i64,
    pub external_id: Option<String>,
    pub description: Option<String>,
    pub address: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub cn_batcher_id: Option<i64>,
    pub cn_batcher_label: Option<String>,
    pub webhook_url: Option<String>,
    pub cn_output_id: Option<i64>,
    pub merged_output: bool,
    pub calledback: bool,
    pub calledback_timestamp: Option<DateTime<Utc>>,
    pub batch_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row data for a request that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatchRequest {
    pub external_id: Option<String>,
    pub description: Option<String>,
    pub address: String,
    pub amount: Decimal,
    pub cn_batcher_id: Option<i64>,
    pub cn_batcher_label: Option<String>,
    pub webhook_url: Option<String>,
    pub cn_output_id: Option<i64>,
    pub merged_output: bool,
    pub batch_id: i64,
}

/// A batch together with the requests it owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWithRequests {
    #[serde(flatten)]
    pub batch: Batch,
    pub batch_requests: Vec<BatchRequest>,
}

impl BatchWithRequests {
    /// Sum of the individually recorded request amounts.
    pub fn total_amount(&self) -> Decimal {
        self.batch_requests.iter().map(|br| br.amount).sum()
    }
}

// RPC parameters

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueForNextBatchParams {
    #[serde(default, deserialize_with = "string_or_number")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub batcher_id: Option<i64>,
    #[serde(default)]
    pub batcher_label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueParams {
    pub batch_request_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueAndPayParams {
    #[serde(default)]
    pub batch_request_id: i64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub conf_target: Option<u32>,
    #[serde(default)]
    pub replaceable: Option<bool>,
    #[serde(default, rename = "subtractfeefromamount")]
    pub subtract_fee_from_amount: Option<bool>,
}

/// Identifies a batch directly, through one of its requests, or (when both
/// are absent) as the default batcher's ongoing batch.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSelector {
    #[serde(default)]
    pub batch_id: Option<i64>,
    #[serde(default)]
    pub batch_request_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBatchParams {
    #[serde(default)]
    pub batch_id: Option<i64>,
    #[serde(default)]
    pub batch_request_id: Option<i64>,
    #[serde(default)]
    pub conf_target: Option<u32>,
}

impl ExecuteBatchParams {
    pub fn selector(&self) -> BatchSelector {
        BatchSelector {
            batch_id: self.batch_id,
            batch_request_id: self.batch_request_id,
        }
    }
}

// RPC results

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequestResult {
    pub batch_id: i64,
    pub batch_request_id: i64,
    pub eta_seconds: i64,
    pub cn_result: AddToBatchResult,
    pub address: String,
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub amount: Decimal,
}

/// Outcome of the direct spend half of dequeueAndPay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendOutcome {
    Result(SpendResult),
    Error(RpcError),
}

/// The dequeue always succeeded when this is returned; the spend may not have.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueAndPayResult {
    pub dequeue_result: BatchRequestResult,
    pub spend_result: SpendOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBatchResult {
    pub batch: Batch,
    pub cn_result: BatchSpendResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetails {
    pub batch: BatchWithRequests,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<i64>,
}

// Webhooks

/// Callback posted by the gateway when an output's transaction changes state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCallback {
    pub output_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Payload delivered to a request's own webhook URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    pub batch_request_id: i64,
    pub batch_id: i64,
    pub cn_batcher_id: i64,
    pub request_count_in_batch: i64,
    pub status: Option<String>,
    pub txid: Option<String>,
    pub hash: Option<String>,
    pub details: Value,
}

/// Per-recipient outcome of a webhook fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReport {
    pub output_id: i64,
    pub notified: Vec<i64>,
    pub failed: Vec<i64>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
