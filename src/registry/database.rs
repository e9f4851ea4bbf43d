//! SQLite Registry Module
//!
//! This module implements the request store on top of a SQLite database
//! through sqlx.
//!
//! # Storage
//! - `batch`: one row per gateway batcher run, terminal once `txid` is set
//! - `batch_request`: one row per queued payment, pointing at its batch
//!
//! Amounts are stored as canonical decimal text so that no precision is lost,
//! timestamps as unix milliseconds.

use super::{RequestStore, StoreError, StoreResult};
use crate::types::{Batch, BatchRequest, NewBatchRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS batch (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cn_batcher_id INTEGER NOT NULL,
        txid TEXT,
        spent_details TEXT,
        spent_ts INTEGER,
        created_ts INTEGER NOT NULL,
        updated_ts INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_batch_cn_batcher_id ON batch (cn_batcher_id)",
    "CREATE INDEX IF NOT EXISTS idx_batch_txid ON batch (txid)",
    "CREATE TABLE IF NOT EXISTS batch_request (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT,
        description TEXT,
        address TEXT NOT NULL,
        amount TEXT NOT NULL,
        cn_batcher_id INTEGER,
        cn_batcher_label TEXT,
        webhook_url TEXT,
        calledback INTEGER NOT NULL DEFAULT 0,
        calledback_ts INTEGER,
        batch_id INTEGER NOT NULL REFERENCES batch (id),
        cn_output_id INTEGER,
        merged_output INTEGER NOT NULL DEFAULT 0,
        created_ts INTEGER NOT NULL,
        updated_ts INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_batch_request_external_id ON batch_request (external_id)",
    "CREATE INDEX IF NOT EXISTS idx_batch_request_cn_batcher_id ON batch_request (cn_batcher_id)",
    "CREATE INDEX IF NOT EXISTS idx_batch_request_cn_output_id ON batch_request (cn_output_id)",
];

const REQUEST_COLUMNS: &str = "br.id AS id, br.external_id AS external_id, \
     br.description AS description, br.address AS address, br.amount AS amount, \
     br.cn_batcher_id AS cn_batcher_id, br.cn_batcher_label AS cn_batcher_label, \
     br.webhook_url AS webhook_url, br.cn_output_id AS cn_output_id, \
     br.merged_output AS merged_output, br.calledback AS calledback, \
     br.calledback_ts AS calledback_ts, br.batch_id AS batch_id, \
     br.created_ts AS created_ts, br.updated_ts AS updated_ts";

const BATCH_COLUMNS: &str = "b.id AS id, b.cn_batcher_id AS cn_batcher_id, b.txid AS txid, \
     b.spent_details AS spent_details, b.spent_ts AS spent_ts, \
     b.created_ts AS created_ts, b.updated_ts AS updated_ts";

/// Request store backed by SQLite
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the database and create the schema if needed
    ///
    /// # Arguments
    /// * `url` - sqlx SQLite URL (e.g., "sqlite://data/batcher.sqlite?mode=rwc")
    pub async fn connect(url: &str) -> StoreResult<Self> {
        info!("Opening batch registry at {}", url);

        // Every connection to an in-memory database sees its own empty database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    async fn fetch_requests(&self, sql: &str, binds: Binds<'_>) -> StoreResult<Vec<BatchRequest>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                Bind::Int(v) => query.bind(v),
                Bind::Text(v) => query.bind(v),
            };
        }
        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(request_from_row)
            .collect()
    }

    async fn fetch_batch(&self, sql: &str, id: i64) -> StoreResult<Option<Batch>> {
        sqlx::query(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(batch_from_row)
            .transpose()
    }
}

enum Bind<'a> {
    Int(i64),
    Text(&'a str),
}

type Binds<'a> = Vec<Bind<'a>>;

#[async_trait]
impl RequestStore for SqliteStore {
    async fn insert_request(&self, request: NewBatchRequest) -> StoreResult<BatchRequest> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO batch_request (external_id, description, address, amount, cn_batcher_id, \
             cn_batcher_label, webhook_url, cn_output_id, merged_output, calledback, batch_id, \
             created_ts, updated_ts) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&request.external_id)
        .bind(&request.description)
        .bind(&request.address)
        .bind(request.amount.normalize().to_string())
        .bind(request.cn_batcher_id)
        .bind(&request.cn_batcher_label)
        .bind(&request.webhook_url)
        .bind(request.cn_output_id)
        .bind(request.merged_output)
        .bind(request.batch_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Inserted batch request {}", id);
        self.find_request(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch request {}", id)))
    }

    async fn save_requests(&self, requests: &[BatchRequest]) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for request in requests {
            sqlx::query(
                "UPDATE batch_request SET external_id = ?, description = ?, address = ?, amount = ?, \
                 cn_batcher_id = ?, cn_batcher_label = ?, webhook_url = ?, cn_output_id = ?, \
                 merged_output = ?, calledback = ?, calledback_ts = ?, batch_id = ?, updated_ts = ? \
                 WHERE id = ?",
            )
            .bind(&request.external_id)
            .bind(&request.description)
            .bind(&request.address)
            .bind(request.amount.normalize().to_string())
            .bind(request.cn_batcher_id)
            .bind(&request.cn_batcher_label)
            .bind(&request.webhook_url)
            .bind(request.cn_output_id)
            .bind(request.merged_output)
            .bind(request.calledback)
            .bind(request.calledback_timestamp.map(|t| t.timestamp_millis()))
            .bind(request.batch_id)
            .bind(now)
            .bind(request.batch_request_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_request(&self, batch_request_id: i64) -> StoreResult<Option<BatchRequest>> {
        let sql = format!("SELECT {} FROM batch_request br WHERE br.id = ?", REQUEST_COLUMNS);
        Ok(self
            .fetch_requests(&sql, vec![Bind::Int(batch_request_id)])
            .await?
            .into_iter()
            .next())
    }

    async fn delete_request(&self, batch_request_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM batch_request WHERE id = ?")
            .bind(batch_request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_requests_by_output_id(&self, cn_output_id: i64) -> StoreResult<Vec<BatchRequest>> {
        let sql = format!(
            "SELECT {} FROM batch_request br WHERE br.cn_output_id = ? ORDER BY br.id",
            REQUEST_COLUMNS
        );
        self.fetch_requests(&sql, vec![Bind::Int(cn_output_id)]).await
    }

    async fn find_pending_requests_by_address_and_batcher_id(
        &self,
        address: &str,
        cn_batcher_id: i64,
    ) -> StoreResult<Vec<BatchRequest>> {
        let sql = format!(
            "SELECT {} FROM batch_request br INNER JOIN batch b ON b.id = br.batch_id \
             WHERE br.address = ? AND br.cn_batcher_id = ? AND b.txid IS NULL ORDER BY br.id",
            REQUEST_COLUMNS
        );
        self.fetch_requests(&sql, vec![Bind::Text(address), Bind::Int(cn_batcher_id)])
            .await
    }

    async fn find_pending_requests_by_address_and_batcher_label(
        &self,
        address: &str,
        cn_batcher_label: &str,
    ) -> StoreResult<Vec<BatchRequest>> {
        let sql = format!(
            "SELECT {} FROM batch_request br INNER JOIN batch b ON b.id = br.batch_id \
             WHERE br.address = ? AND br.cn_batcher_label = ? AND b.txid IS NULL ORDER BY br.id",
            REQUEST_COLUMNS
        );
        self.fetch_requests(&sql, vec![Bind::Text(address), Bind::Text(cn_batcher_label)])
            .await
    }

    async fn find_requests_in_batch(&self, batch_id: i64) -> StoreResult<Vec<BatchRequest>> {
        let sql = format!(
            "SELECT {} FROM batch_request br WHERE br.batch_id = ? ORDER BY br.id",
            REQUEST_COLUMNS
        );
        self.fetch_requests(&sql, vec![Bind::Int(batch_id)]).await
    }

    async fn count_requests_in_batch(&self, batch_id: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_request WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_batch(&self, cn_batcher_id: i64) -> StoreResult<Batch> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO batch (cn_batcher_id, created_ts, updated_ts) VALUES (?, ?, ?)",
        )
        .bind(cn_batcher_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Created batch {} for batcher {}", id, cn_batcher_id);
        self.find_batch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))
    }

    async fn save_batch(&self, batch: &Batch) -> StoreResult<Batch> {
        sqlx::query(
            "UPDATE batch SET cn_batcher_id = ?, txid = ?, spent_details = ?, spent_ts = ?, \
             updated_ts = ? WHERE id = ?",
        )
        .bind(batch.cn_batcher_id)
        .bind(&batch.txid)
        .bind(&batch.spent_details)
        .bind(batch.spent_timestamp.map(|t| t.timestamp_millis()))
        .bind(Utc::now().timestamp_millis())
        .bind(batch.batch_id)
        .execute(&self.pool)
        .await?;

        self.find_batch(batch.batch_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", batch.batch_id)))
    }

    async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>> {
        let sql = format!("SELECT {} FROM batch b WHERE b.id = ?", BATCH_COLUMNS);
        self.fetch_batch(&sql, batch_id).await
    }

    async fn find_batch_by_request(&self, batch_request_id: i64) -> StoreResult<Option<Batch>> {
        let sql = format!(
            "SELECT {} FROM batch b INNER JOIN batch_request br ON br.batch_id = b.id WHERE br.id = ?",
            BATCH_COLUMNS
        );
        self.fetch_batch(&sql, batch_request_id).await
    }

    async fn find_ongoing_batch(&self, cn_batcher_id: i64) -> StoreResult<Option<Batch>> {
        let sql = format!(
            "SELECT {} FROM batch b WHERE b.cn_batcher_id = ? AND b.txid IS NULL ORDER BY b.id LIMIT 1",
            BATCH_COLUMNS
        );
        self.fetch_batch(&sql, cn_batcher_id).await
    }

    async fn list_ongoing_batches(&self) -> StoreResult<Vec<Batch>> {
        let sql = format!("SELECT {} FROM batch b WHERE b.txid IS NULL ORDER BY b.id", BATCH_COLUMNS);
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(batch_from_row)
            .collect()
    }
}

fn request_from_row(row: &SqliteRow) -> StoreResult<BatchRequest> {
    let amount: String = row.try_get("amount")?;
    let amount = Decimal::from_str(&amount)
        .map_err(|e| StoreError::Corrupt(format!("amount {:?}: {}", amount, e)))?;

    Ok(BatchRequest {
        batch_request_id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        description: row.try_get("description")?,
        address: row.try_get("address")?,
        amount,
        cn_batcher_id: row.try_get("cn_batcher_id")?,
        cn_batcher_label: row.try_get("cn_batcher_label")?,
        webhook_url: row.try_get("webhook_url")?,
        cn_output_id: row.try_get("cn_output_id")?,
        merged_output: row.try_get("merged_output")?,
        calledback: row.try_get("calledback")?,
        calledback_timestamp: optional_timestamp(row.try_get("calledback_ts")?)?,
        batch_id: row.try_get("batch_id")?,
        created_at: timestamp(row.try_get("created_ts")?)?,
        updated_at: timestamp(row.try_get("updated_ts")?)?,
    })
}

fn batch_from_row(row: &SqliteRow) -> StoreResult<Batch> {
    Ok(Batch {
        batch_id: row.try_get("id")?,
        cn_batcher_id: row.try_get("cn_batcher_id")?,
        txid: row.try_get("txid")?,
        spent_details: row.try_get("spent_details")?,
        spent_timestamp: optional_timestamp(row.try_get("spent_ts")?)?,
        created_at: timestamp(row.try_get("created_ts")?)?,
        updated_at: timestamp(row.try_get("updated_ts")?)?,
    })
}

fn timestamp(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {}", millis)))
}

fn optional_timestamp(millis: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    millis.map(timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn new_request(batch_id: i64, address: &str, amount: Decimal, output_id: i64) -> NewBatchRequest {
        NewBatchRequest {
            external_id: Some("ext-1".into()),
            description: Some("payout".into()),
            address: address.to_string(),
            amount,
            cn_batcher_id: Some(1),
            cn_batcher_label: Some("default".into()),
            webhook_url: None,
            cn_output_id: Some(output_id),
            merged_output: false,
            batch_id,
        }
    }

    #[tokio::test]
    async fn test_amount_survives_round_trip_exactly() {
        let store = store().await;
        let batch = store.insert_batch(1).await.unwrap();
        let stored = store
            .insert_request(new_request(batch.batch_id, "bc1qa", dec!(0.00000003), 7))
            .await
            .unwrap();

        let loaded = store.find_request(stored.batch_request_id).await.unwrap().unwrap();
        assert_eq!(loaded.amount, dec!(0.00000003));
        assert_eq!(loaded.external_id.as_deref(), Some("ext-1"));
        assert!(!loaded.merged_output);
        assert!(!loaded.calledback);
    }

    #[tokio::test]
    async fn test_pending_lookup_ignores_terminal_batches() {
        let store = store().await;
        let mut spent = store.insert_batch(1).await.unwrap();
        store
            .insert_request(new_request(spent.batch_id, "bc1qa", dec!(1), 1))
            .await
            .unwrap();
        spent.txid = Some("deadbeef".into());
        spent.spent_timestamp = Some(Utc::now());
        store.save_batch(&spent).await.unwrap();

        let ongoing = store.insert_batch(1).await.unwrap();
        store
            .insert_request(new_request(ongoing.batch_id, "bc1qa", dec!(2), 2))
            .await
            .unwrap();

        let pending = store
            .find_pending_requests_by_address_and_batcher_id("bc1qa", 1)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, dec!(2));

        let by_label = store
            .find_pending_requests_by_address_and_batcher_label("bc1qa", "default")
            .await
            .unwrap();
        assert_eq!(by_label.len(), 1);

        let found = store.find_ongoing_batch(1).await.unwrap().unwrap();
        assert_eq!(found.batch_id, ongoing.batch_id);
        assert_eq!(store.list_ongoing_batches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_delete_and_count() {
        let store = store().await;
        let batch = store.insert_batch(3).await.unwrap();
        let first = store
            .insert_request(new_request(batch.batch_id, "bc1qa", dec!(1), 10))
            .await
            .unwrap();
        let mut second = store
            .insert_request(new_request(batch.batch_id, "bc1qb", dec!(2), 11))
            .await
            .unwrap();
        assert_eq!(store.count_requests_in_batch(batch.batch_id).await.unwrap(), 2);

        second.cn_output_id = Some(10);
        second.merged_output = true;
        second.calledback = true;
        second.calledback_timestamp = Some(Utc::now());
        store.save_requests(&[second.clone()]).await.unwrap();

        let siblings = store.find_requests_by_output_id(10).await.unwrap();
        assert_eq!(siblings.len(), 2);
        assert!(siblings[1].merged_output);
        assert!(siblings[1].calledback);
        assert!(siblings[1].calledback_timestamp.is_some());

        let owner = store.find_batch_by_request(first.batch_request_id).await.unwrap().unwrap();
        assert_eq!(owner.batch_id, batch.batch_id);

        store.delete_request(first.batch_request_id).await.unwrap();
        assert!(store.find_request(first.batch_request_id).await.unwrap().is_none());
        assert_eq!(store.count_requests_in_batch(batch.batch_id).await.unwrap(), 1);
    }
}
