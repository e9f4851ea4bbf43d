use super::{RequestStore, StoreError, StoreResult};
use crate::types::{Batch, BatchRequest, NewBatchRequest};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    batches: BTreeMap<i64, Batch>,
    requests: BTreeMap<i64, BatchRequest>,
    next_batch_id: i64,
    next_request_id: i64,
}

impl Tables {
    fn is_pending(&self, request: &BatchRequest) -> bool {
        self.batches
            .get(&request.batch_id)
            .is_some_and(|b| !b.is_terminal())
    }
}

/// A thread-safe in-memory request store.
///
/// Uses `Arc<RwLock<..>>` to allow shared concurrent access.
/// Ideal for testing or dry runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn insert_request(&self, request: NewBatchRequest) -> StoreResult<BatchRequest> {
        let mut tables = self.tables.write().await;
        tables.next_request_id += 1;
        let now = Utc::now();
        let stored = BatchRequest {
            batch_request_id: tables.next_request_id,
            external_id: request.external_id,
            description: request.description,
            address: request.address,
            amount: request.amount,
            cn_batcher_id: request.cn_batcher_id,
            cn_batcher_label: request.cn_batcher_label,
            webhook_url: request.webhook_url,
            cn_output_id: request.cn_output_id,
            merged_output: request.merged_output,
            calledback: false,
            calledback_timestamp: None,
            batch_id: request.batch_id,
            created_at: now,
            updated_at: now,
        };
        tables.requests.insert(stored.batch_request_id, stored.clone());
        Ok(stored)
    }

    async fn save_requests(&self, requests: &[BatchRequest]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        for request in requests {
            // Like an UPDATE, saving a deleted row is a no-op.
            if let Some(existing) = tables.requests.get_mut(&request.batch_request_id) {
                *existing = BatchRequest {
                    updated_at: now,
                    ..request.clone()
                };
            }
        }
        Ok(())
    }

    async fn find_request(&self, batch_request_id: i64) -> StoreResult<Option<BatchRequest>> {
        let tables = self.tables.read().await;
        Ok(tables.requests.get(&batch_request_id).cloned())
    }

    async fn delete_request(&self, batch_request_id: i64) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.requests.remove(&batch_request_id);
        Ok(())
    }

    async fn find_requests_by_output_id(&self, cn_output_id: i64) -> StoreResult<Vec<BatchRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .values()
            .filter(|r| r.cn_output_id == Some(cn_output_id))
            .cloned()
            .collect())
    }

    async fn find_pending_requests_by_address_and_batcher_id(
        &self,
        address: &str,
        cn_batcher_id: i64,
    ) -> StoreResult<Vec<BatchRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .values()
            .filter(|r| r.address == address && r.cn_batcher_id == Some(cn_batcher_id))
            .filter(|r| tables.is_pending(r))
            .cloned()
            .collect())
    }

    async fn find_pending_requests_by_address_and_batcher_label(
        &self,
        address: &str,
        cn_batcher_label: &str,
    ) -> StoreResult<Vec<BatchRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .values()
            .filter(|r| r.address == address && r.cn_batcher_label.as_deref() == Some(cn_batcher_label))
            .filter(|r| tables.is_pending(r))
            .cloned()
            .collect())
    }

    async fn find_requests_in_batch(&self, batch_id: i64) -> StoreResult<Vec<BatchRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn count_requests_in_batch(&self, batch_id: i64) -> StoreResult<i64> {
        let tables = self.tables.read().await;
        Ok(tables.requests.values().filter(|r| r.batch_id == batch_id).count() as i64)
    }

    async fn insert_batch(&self, cn_batcher_id: i64) -> StoreResult<Batch> {
        let mut tables = self.tables.write().await;
        tables.next_batch_id += 1;
        let now = Utc::now();
        let batch = Batch {
            batch_id: tables.next_batch_id,
            cn_batcher_id,
            txid: None,
            spent_details: None,
            spent_timestamp: None,
            created_at: now,
            updated_at: now,
        };
        tables.batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    async fn save_batch(&self, batch: &Batch) -> StoreResult<Batch> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .batches
            .get_mut(&batch.batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", batch.batch_id)))?;
        *existing = Batch {
            updated_at: Utc::now(),
            ..batch.clone()
        };
        Ok(existing.clone())
    }

    async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>> {
        let tables = self.tables.read().await;
        Ok(tables.batches.get(&batch_id).cloned())
    }

    async fn find_batch_by_request(&self, batch_request_id: i64) -> StoreResult<Option<Batch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .get(&batch_request_id)
            .and_then(|r| tables.batches.get(&r.batch_id))
            .cloned())
    }

    async fn find_ongoing_batch(&self, cn_batcher_id: i64) -> StoreResult<Option<Batch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batches
            .values()
            .find(|b| b.cn_batcher_id == cn_batcher_id && !b.is_terminal())
            .cloned())
    }

    async fn list_ongoing_batches(&self) -> StoreResult<Vec<Batch>> {
        let tables = self.tables.read().await;
        Ok(tables
            .batches
            .values()
            .filter(|b| !b.is_terminal())
            .cloned()
            .collect())
    }
}
