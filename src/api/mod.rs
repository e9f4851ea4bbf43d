//! API Module
//!
//! This module exposes the batching engine over JSON-RPC and receives the
//! gateway's output callbacks.

mod rpc;
mod server;

pub use rpc::{JsonRpcRequest, JsonRpcResponse, RpcOutcome};
pub use server::Server;
