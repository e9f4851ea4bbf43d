//! Wallet Gateway Module
//!
//! This module talks to the external wallet-management service that owns the
//! keys and broadcasts transactions. The batcher never builds transactions
//! itself; it only registers and removes outputs and asks for execution.
//!
//! - [`PaymentGateway`]: the contract consumed by the engine
//! - [`GatewayClient`]: HTTP implementation with per-call signed tokens

mod client;
mod token;

pub use client::GatewayClient;
pub use token::TokenSigner;

use crate::config::GatewayConfig;
use crate::error::RpcError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// The gateway answered with an error of its own.
    #[error("gateway rejected the call: {0}")]
    Rejected(RpcError),

    /// Timeout, refused connection or TLS failure: nothing is known about
    /// the outcome on the gateway side.
    #[error("gateway unreachable: {0}")]
    Unavailable(String),

    /// The gateway answered but the body was not understood.
    #[error("unrecognized gateway response: {0}")]
    Malformed(String),

    #[error("gateway client misconfigured: {0}")]
    Config(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Output registration request (`addtobatch`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToBatchRequest {
    pub address: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batcher_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batcher_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Batcher state returned by output registration and removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToBatchResult {
    pub batcher_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_outputs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest: Option<Value>,
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub total: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSpendRequest {
    pub batcher_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf_target: Option<u32>,
}

/// Result of executing a batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpendResult {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Per-output list, redundant with the locally tracked requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Batcher fields (batcherId, confTarget, nbOutputs, total, ...).
    #[serde(flatten)]
    pub batcher: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendRequest {
    pub address: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf_target: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaceable: Option<bool>,
    #[serde(rename = "subtractfeefromamount", skip_serializing_if = "Option::is_none")]
    pub subtract_fee_from_amount: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendResult {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Remote wallet operations used by the batching engine.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn add_to_batch(&self, request: AddToBatchRequest) -> GatewayResult<AddToBatchResult>;
    async fn remove_from_batch(&self, output_id: i64) -> GatewayResult<AddToBatchResult>;
    async fn batch_spend(&self, request: BatchSpendRequest) -> GatewayResult<BatchSpendResult>;
    async fn spend(&self, request: SpendRequest) -> GatewayResult<SpendResult>;

    /// Apply new connection settings. Implementations without settings ignore it.
    async fn reconfigure(&self, _config: &GatewayConfig) -> GatewayResult<()> {
        Ok(())
    }
}

pub type GatewayRef = Arc<dyn PaymentGateway>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_add_to_batch_request_emits_numbers() {
        let request = AddToBatchRequest {
            address: "bc1qa".into(),
            amount: dec!(0.00000003),
            output_label: Some("a b".into()),
            batcher_id: Some(1),
            batcher_label: None,
            webhook_url: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["amount"], json!(0.00000003));
        assert_eq!(value["outputLabel"], "a b");
        assert!(value.get("batcherLabel").is_none());
    }

    #[test]
    fn test_batch_spend_result_keeps_batcher_fields() {
        let result: BatchSpendResult = serde_json::from_value(json!({
            "batcherId": 1,
            "nbOutputs": 2,
            "txid": "abc",
            "hash": "def",
            "details": { "fee": 0.0001 },
            "outputs": { "bc1qa": 0.1 }
        }))
        .unwrap();
        assert_eq!(result.txid, "abc");
        assert_eq!(result.batcher["batcherId"], 1);
        assert!(result.outputs.is_some());
    }

    #[test]
    fn test_add_to_batch_result_parses_total() {
        let result: AddToBatchResult = serde_json::from_value(json!({
            "batcherId": 1, "outputId": 9, "nbOutputs": 3, "oldest": 123, "total": 0.00000003
        }))
        .unwrap();
        assert_eq!(result.output_id, Some(9));
        assert_eq!(result.total, Some(dec!(0.00000003)));
    }
}
