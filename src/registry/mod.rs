//! Batch Registry Module
//!
//! This module provides persistence for batches and batch requests.
//! The engine only depends on the [`RequestStore`] contract; two backends
//! implement it:
//! - `SqliteStore`: durable storage through sqlx
//! - `InMemoryStore`: non-persistent storage for tests and dry runs

mod database;
mod memory;

pub use database::SqliteStore;
pub use memory::InMemoryStore;

use crate::types::{Batch, BatchRequest, NewBatchRequest};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Query contract the batching engine relies on.
///
/// "Pending" and "ongoing" always mean: belonging to a batch whose `txid`
/// is still null.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(&self, request: NewBatchRequest) -> StoreResult<BatchRequest>;
    async fn save_requests(&self, requests: &[BatchRequest]) -> StoreResult<()>;
    async fn find_request(&self, batch_request_id: i64) -> StoreResult<Option<BatchRequest>>;
    async fn delete_request(&self, batch_request_id: i64) -> StoreResult<()>;
    async fn find_requests_by_output_id(&self, cn_output_id: i64) -> StoreResult<Vec<BatchRequest>>;
    async fn find_pending_requests_by_address_and_batcher_id(
        &self,
        address: &str,
        cn_batcher_id: i64,
    ) -> StoreResult<Vec<BatchRequest>>;
    async fn find_pending_requests_by_address_and_batcher_label(
        &self,
        address: &str,
        cn_batcher_label: &str,
    ) -> StoreResult<Vec<BatchRequest>>;
    async fn find_requests_in_batch(&self, batch_id: i64) -> StoreResult<Vec<BatchRequest>>;
    async fn count_requests_in_batch(&self, batch_id: i64) -> StoreResult<i64>;

    async fn insert_batch(&self, cn_batcher_id: i64) -> StoreResult<Batch>;
    async fn save_batch(&self, batch: &Batch) -> StoreResult<Batch>;
    async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>>;
    async fn find_batch_by_request(&self, batch_request_id: i64) -> StoreResult<Option<Batch>>;
    async fn find_ongoing_batch(&self, cn_batcher_id: i64) -> StoreResult<Option<Batch>>;
    async fn list_ongoing_batches(&self) -> StoreResult<Vec<Batch>>;
}

pub type StoreRef = Arc<dyn RequestStore>;

/// Open the backend named by a database URL.
pub async fn open(url: &str) -> StoreResult<StoreRef> {
    if url == "memory" {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::connect(url).await?))
}
