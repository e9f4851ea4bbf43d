//! Error taxonomy shared by the engine and the RPC surface.

use crate::gateway::GatewayError;
use crate::registry::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC error codes understood by callers.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Gateway and local store disagree and automatic compensation failed.
    pub const RECONCILE_REQUIRED: i64 = -32000;
}

/// JSON-RPC error object
///
/// Used both for errors we emit and for errors relayed verbatim from the
/// gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Errors returned by batching engine operations.
#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    Internal(String),

    /// Error returned by the gateway, relayed unchanged.
    #[error("gateway error: {0}")]
    Gateway(RpcError),

    /// The gateway could not be reached or did not answer in time.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// A multi-step gateway sequence failed halfway and could not be undone.
    #[error("{message}")]
    ReconcileRequired { message: String, data: Value },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BatcherError>;

impl BatcherError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        BatcherError::InvalidRequest(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        BatcherError::InvalidParams(message.into())
    }

    pub fn code(&self) -> i64 {
        match self {
            BatcherError::InvalidRequest(_) => codes::INVALID_REQUEST,
            BatcherError::InvalidParams(_) => codes::INVALID_PARAMS,
            BatcherError::Internal(_)
            | BatcherError::GatewayUnavailable(_)
            | BatcherError::Store(_) => codes::INTERNAL_ERROR,
            BatcherError::Gateway(e) => e.code,
            BatcherError::ReconcileRequired { .. } => codes::RECONCILE_REQUIRED,
        }
    }

    /// Convert into the wire representation.
    pub fn to_rpc(&self) -> RpcError {
        match self {
            BatcherError::Gateway(e) => e.clone(),
            BatcherError::ReconcileRequired { message, data } => RpcError {
                code: codes::RECONCILE_REQUIRED,
                message: message.clone(),
                data: Some(data.clone()),
            },
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

impl From<GatewayError> for BatcherError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(e) => BatcherError::Gateway(e),
            GatewayError::Unavailable(msg) => BatcherError::GatewayUnavailable(msg),
            GatewayError::Malformed(_) => BatcherError::Internal("An unknown error occurred".into()),
            GatewayError::Config(msg) => BatcherError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gateway_errors_pass_through() {
        let native = RpcError::new(-5, "Output not found");
        let err = BatcherError::Gateway(native.clone());
        assert_eq!(err.code(), -5);
        assert_eq!(err.to_rpc(), native);
    }

    #[test]
    fn test_reconcile_required_carries_data() {
        let err = BatcherError::ReconcileRequired {
            message: "Output lost at gateway".into(),
            data: json!({ "batchRequestIds": [1, 2] }),
        };
        let rpc = err.to_rpc();
        assert_eq!(rpc.code, codes::RECONCILE_REQUIRED);
        assert_eq!(rpc.data, Some(json!({ "batchRequestIds": [1, 2] })));
    }

    #[test]
    fn test_malformed_gateway_response_is_internal() {
        let err: BatcherError = GatewayError::Malformed("HTTP 502".into()).into();
        assert_eq!(err.code(), codes::INTERNAL_ERROR);
        assert_eq!(err.to_string(), "An unknown error occurred");
    }

    #[test]
    fn test_unavailable_is_distinct_from_invalid_params() {
        let down = BatcherError::GatewayUnavailable("timed out".into());
        let missing = BatcherError::invalid_params("Batch request does not exist");
        assert_eq!(down.code(), codes::INTERNAL_ERROR);
        assert_eq!(missing.code(), codes::INVALID_PARAMS);
        assert!(down.to_string().starts_with("gateway unavailable"));
    }
}
