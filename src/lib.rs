//! This crate batches outgoing Bitcoin payments through an external wallet gateway.
//! Callers queue payments over JSON-RPC, requests to the same address are merged
//! into one output, and batches are executed on a timer, on reaching an amount
//! threshold, or on demand.

pub mod types; // Batches, batch requests, RPC parameters and results.
pub mod api; // JSON-RPC server and webhook endpoint.
pub mod validation; // Argument checks and address normalisation.
pub mod scheduler; // Timeout and threshold triggers.
pub mod batch; // The batching engine.
pub mod registry; // Persistence of batches and requests.
pub mod gateway; // Client for the wallet gateway.
pub mod notify; // Outbound webhook delivery.
pub mod error; // Error taxonomy and JSON-RPC codes.
pub mod config; // Defines and loads system configuration.

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types and configurations for easier access.
pub use types::*;
pub use config::Config;
pub use batch::{BatchingEngine, EngineSettings};
pub use error::{BatcherError, RpcError};
