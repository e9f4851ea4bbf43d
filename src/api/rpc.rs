//! JSON-RPC envelope types

use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming JSON-RPC request
///
/// `jsonrpc` is accepted but not enforced; `params` and `id` may be omitted.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

/// Either `result` or `error`, never both.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcError),
}

/// Outgoing JSON-RPC response, echoing the request id.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: &'static str,
    pub id: Value,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            outcome: RpcOutcome::Result(result),
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            outcome: RpcOutcome::Error(error),
        }
    }
}
