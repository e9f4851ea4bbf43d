//! Batching Engine Module
//!
//! Owns every state transition of batches and batch requests. Each mutating
//! operation runs under a single process-wide lock, so the gateway calls and
//! store writes of one operation never interleave with another's.

use super::merge;
use crate::config::Config;
use crate::error::{BatcherError, Result};
use crate::gateway::{AddToBatchRequest, AddToBatchResult, BatchSpendRequest, GatewayRef, SpendRequest};
use crate::notify::NotifierRef;
use crate::registry::StoreRef;
use crate::scheduler::BatchClock;
use crate::types::{
    Batch, BatchDetails, BatchRequest, BatchRequestResult, BatchSelector, BatchWithRequests,
    DequeueAndPayParams, DequeueAndPayResult, ExecuteBatchParams, ExecuteBatchResult,
    NewBatchRequest, QueueForNextBatchParams, SpendOutcome, WebhookCallback,
    WebhookNotification, WebhookReport,
};
use crate::validation::{normalize_address, Validator};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

const REQUEST_NOT_PENDING: &str = "Batch request does not exist or is already spent";

/// Settings the engine reads on every call; replaced on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub default_batcher_id: i64,
    /// URL the gateway calls back when an output's transaction changes state.
    pub callback_url: String,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_batcher_id: config.batch.default_batcher_id,
            callback_url: config.api.callback_url(),
        }
    }
}

/// Batching engine
///
/// Translates caller requests into gateway output registrations and keeps the
/// local registry consistent with the gateway's batchers.
pub struct BatchingEngine {
    store: StoreRef,
    gateway: GatewayRef,
    notifier: NotifierRef,
    clock: Arc<BatchClock>,
    settings: RwLock<EngineSettings>,
    batch_modif: Mutex<()>,
}

impl BatchingEngine {
    pub fn new(
        store: StoreRef,
        gateway: GatewayRef,
        notifier: NotifierRef,
        clock: Arc<BatchClock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            clock,
            settings: RwLock::new(settings),
            batch_modif: Mutex::new(()),
        }
    }

    pub async fn reconfigure(&self, settings: EngineSettings) {
        info!(
            "Engine reconfigured: default batcher {}, callback {}",
            settings.default_batcher_id, settings.callback_url
        );
        *self.settings.write().await = settings;
    }

    pub async fn settings(&self) -> EngineSettings {
        self.settings.read().await.clone()
    }

    async fn lock(&self, operation: &str) -> MutexGuard<'_, ()> {
        debug!("{}: waiting for batch lock", operation);
        let guard = self.batch_modif.lock().await;
        debug!("{}: batch lock acquired", operation);
        guard
    }

    /// Queue a payment for the next batch of the selected batcher.
    ///
    /// A pending request for the same address on the same batcher causes the
    /// existing gateway output to be replaced by one paying the sum.
    ///
    /// # Arguments
    /// * `params` - Destination, amount and batcher selection (id, label or default)
    ///
    /// # Returns
    /// The new request with its batch, the gateway's batcher summary and the
    /// seconds left in the current window
    pub async fn queue_for_next_batch(&self, params: QueueForNextBatchParams) -> Result<BatchRequestResult> {
        Validator::validate_queue(&params)?;
        let _guard = self.lock("queueForNextBatch").await;
        let settings = self.settings().await;

        // Step 1: Find pending requests this payment merges into
        let address = normalize_address(&params.address);
        let existing = match (params.batcher_id, params.batcher_label.as_deref()) {
            (Some(batcher_id), _) => {
                self.store
                    .find_pending_requests_by_address_and_batcher_id(&address, batcher_id)
                    .await?
            }
            (None, Some(label)) => {
                self.store
                    .find_pending_requests_by_address_and_batcher_label(&address, label)
                    .await?
            }
            (None, None) => {
                self.store
                    .find_pending_requests_by_address_and_batcher_id(&address, settings.default_batcher_id)
                    .await?
            }
        };
        let merging = !existing.is_empty();

        // Step 2: Drop the output being replaced
        let amount = if merging {
            let output_ids: Vec<_> = existing.iter().filter_map(|br| br.cn_output_id).collect();
            if let Some(&output_id) = output_ids.first() {
                info!(
                    "Merging {} into output {} for {} ({} pending requests)",
                    params.amount,
                    output_id,
                    address,
                    existing.len()
                );
                self.gateway.remove_from_batch(output_id).await?;
            }
            merge::merged_amount(&existing, params.amount)
        } else {
            params.amount
        };

        let batcher_id = match (params.batcher_id, &params.batcher_label) {
            (None, None) => Some(settings.default_batcher_id),
            (id, _) => id,
        };
        // Step 3: Register the (possibly merged) output
        let registration = AddToBatchRequest {
            address: address.clone(),
            amount,
            output_label: merge::output_label(&existing, params.description.as_deref()),
            batcher_id,
            batcher_label: params.batcher_label.clone(),
            webhook_url: Some(settings.callback_url.clone()),
        };

        let cn_result = match self.gateway.add_to_batch(registration).await {
            Ok(result) => result,
            Err(err) if merging => {
                let mut prior = existing;
                return Err(self.restore_prior_output(&mut prior, &settings, err.into()).await);
            }
            Err(err) => return Err(err.into()),
        };
        let output_id = registered_output(&cn_result)?;

        // Step 4: Record the request and repoint the merged ones
        let batch = self.ongoing_batch_or_create(cn_result.batcher_id).await?;
        let request = self
            .store
            .insert_request(NewBatchRequest {
                external_id: params.external_id,
                description: params.description,
                address: address.clone(),
                amount: params.amount,
                cn_batcher_id: Some(cn_result.batcher_id),
                cn_batcher_label: params.batcher_label,
                webhook_url: params.webhook_url,
                cn_output_id: Some(output_id),
                merged_output: merging,
                batch_id: batch.batch_id,
            })
            .await?;

        if merging {
            let mut prior = existing;
            for br in prior.iter_mut() {
                br.cn_output_id = Some(output_id);
                br.merged_output = true;
            }
            self.store.save_requests(&prior).await?;
        }

        info!(
            "Queued request {} ({} to {}) in batch {} as output {}",
            request.batch_request_id, request.amount, address, batch.batch_id, output_id
        );
        Ok(BatchRequestResult {
            batch_id: batch.batch_id,
            batch_request_id: request.batch_request_id,
            eta_seconds: self.clock.time_left_secs(),
            cn_result,
            address,
            amount: request.amount,
        })
    }

    /// Withdraw a pending request from its batch.
    pub async fn dequeue_from_next_batch(&self, batch_request_id: i64) -> Result<BatchRequestResult> {
        let _guard = self.lock("dequeueFromNextBatch").await;
        self.dequeue_locked(batch_request_id).await
    }

    /// Withdraw a pending request and pay it immediately in its own transaction.
    ///
    /// A failed spend is reported in the result rather than as an error: the
    /// request is gone from its batch either way.
    ///
    /// # Arguments
    /// * `params` - Request to withdraw, with optional address, amount and fee overrides
    ///
    /// # Returns
    /// The dequeue result and either the spend result or the spend error
    pub async fn dequeue_and_pay(&self, params: DequeueAndPayParams) -> Result<DequeueAndPayResult> {
        Validator::validate_dequeue_and_pay(&params)?;
        let _guard = self.lock("dequeueAndPay").await;

        let dequeue_result = match self.dequeue_locked(params.batch_request_id).await {
            Ok(result) => result,
            Err(err @ BatcherError::ReconcileRequired { .. }) => return Err(err),
            Err(err) => {
                warn!("dequeueAndPay {}: dequeue failed: {}", params.batch_request_id, err);
                return Err(BatcherError::Internal("Could not dequeue request from batch".into()));
            }
        };

        let spend = SpendRequest {
            address: params
                .address
                .as_deref()
                .map(normalize_address)
                .unwrap_or_else(|| dequeue_result.address.clone()),
            amount: params.amount.unwrap_or(dequeue_result.amount),
            conf_target: params.conf_target,
            replaceable: params.replaceable,
            subtract_fee_from_amount: params.subtract_fee_from_amount,
        };
        info!(
            "Paying dequeued request {}: {} to {}",
            params.batch_request_id, spend.amount, spend.address
        );

        let spend_result = match self.gateway.spend(spend).await {
            Ok(result) => SpendOutcome::Result(result),
            Err(err) => {
                warn!("Direct spend for request {} failed: {}", params.batch_request_id, err);
                SpendOutcome::Error(BatcherError::from(err).to_rpc())
            }
        };

        Ok(DequeueAndPayResult {
            dequeue_result,
            spend_result,
        })
    }

    /// Dequeue with the batch lock already held.
    ///
    /// # Arguments
    /// * `batch_request_id` - Request to withdraw; its batch must not be executed
    ///
    /// # Returns
    /// The removed request's batch, address and amount with the gateway's
    /// batcher summary, or `ReconcileRequired` when merged siblings lost
    /// their output
    async fn dequeue_locked(&self, batch_request_id: i64) -> Result<BatchRequestResult> {
        // Step 1: Only requests of a pending batch can leave it
        let request = self
            .store
            .find_request(batch_request_id)
            .await?
            .ok_or_else(|| BatcherError::invalid_params(REQUEST_NOT_PENDING))?;
        let batch = self.store.find_batch(request.batch_id).await?;
        let output_id = match (batch, request.cn_output_id) {
            (Some(batch), Some(output_id)) if !batch.is_terminal() => output_id,
            _ => return Err(BatcherError::invalid_params(REQUEST_NOT_PENDING)),
        };

        // Step 2: Remove the output at the gateway, then locally
        let cn_result = self.gateway.remove_from_batch(output_id).await?;
        self.store.delete_request(batch_request_id).await?;
        info!(
            "Dequeued request {} (output {}) from batch {}",
            batch_request_id, output_id, request.batch_id
        );

        let result = BatchRequestResult {
            batch_id: request.batch_id,
            batch_request_id,
            eta_seconds: self.clock.time_left_secs(),
            cn_result,
            address: request.address.clone(),
            amount: request.amount,
        };

        // Step 3: Requests that shared the output get one of their own
        if request.merged_output {
            let mut siblings = self.store.find_requests_by_output_id(output_id).await?;
            if !siblings.is_empty() {
                let settings = self.settings().await;
                if let Err(err) = self.register_shared_output(&mut siblings, &settings).await {
                    let ids: Vec<i64> = siblings.iter().map(|br| br.batch_request_id).collect();
                    error!(
                        "Output {} removed for request {} but the remaining {:?} could not be re-registered: {}",
                        output_id, batch_request_id, ids, err
                    );
                    return Err(BatcherError::ReconcileRequired {
                        message: "Request dequeued but the remaining merged requests are no longer registered".into(),
                        data: json!({
                            "batchRequestId": batch_request_id,
                            "address": request.address,
                            "amount": merge::total_amount(&siblings).to_string(),
                            "batchRequestIds": ids,
                        }),
                    });
                }
            }
        }

        Ok(result)
    }

    /// Register one output paying the sum of `requests` and point them at it.
    async fn register_shared_output(
        &self,
        requests: &mut [BatchRequest],
        settings: &EngineSettings,
    ) -> Result<AddToBatchResult> {
        let first = requests
            .first()
            .ok_or_else(|| BatcherError::Internal("No requests to register".into()))?;
        let registration = AddToBatchRequest {
            address: first.address.clone(),
            amount: merge::total_amount(requests),
            output_label: merge::output_label(requests, None),
            batcher_id: first.cn_batcher_id,
            batcher_label: first.cn_batcher_label.clone(),
            webhook_url: Some(settings.callback_url.clone()),
        };

        let result = self.gateway.add_to_batch(registration).await?;
        let output_id = registered_output(&result)?;
        let shared = requests.len() > 1;
        for br in requests.iter_mut() {
            br.cn_output_id = Some(output_id);
            br.merged_output = shared;
        }
        self.store.save_requests(requests).await?;
        Ok(result)
    }

    /// Put back the output removed for a merge whose replacement failed.
    ///
    /// Returns the error to surface: `cause` when the prior output
    /// is registered again, a reconcile error otherwise.
    async fn restore_prior_output(
        &self,
        prior: &mut [BatchRequest],
        settings: &EngineSettings,
        cause: BatcherError,
    ) -> BatcherError {
        warn!("Merged output registration failed, restoring prior output: {}", cause);
        match self.register_shared_output(prior, settings).await {
            Ok(_) => cause,
            Err(err) => {
                let ids: Vec<i64> = prior.iter().map(|br| br.batch_request_id).collect();
                let address = prior.first().map(|br| br.address.clone()).unwrap_or_default();
                error!(
                    "Output for {} removed at gateway and could not be restored ({}), requests {:?} are unregistered",
                    address, err, ids
                );
                BatcherError::ReconcileRequired {
                    message: format!("Output removed at gateway but could not be re-registered: {}", cause),
                    data: json!({
                        "address": address,
                        "amount": merge::total_amount(prior).to_string(),
                        "batchRequestIds": ids,
                    }),
                }
            }
        }
    }

    /// Ask the gateway to broadcast a batch and record the transaction.
    ///
    /// # Arguments
    /// * `params` - Batch id or request id, or neither for the default ongoing batch,
    ///   plus the confirmation target
    ///
    /// # Returns
    /// The now terminal batch and the gateway's spend result
    pub async fn execute_batch(&self, params: ExecuteBatchParams) -> Result<ExecuteBatchResult> {
        let _guard = self.lock("executeBatch").await;

        let selector = params.selector();
        let mut batch = self.resolve_batch(selector).await?.ok_or_else(|| {
            if selector.batch_id.is_none() && selector.batch_request_id.is_none() {
                BatcherError::invalid_request("No ongoing batch")
            } else {
                BatcherError::invalid_request("Batch not found")
            }
        })?;
        if batch.is_terminal() {
            return Err(BatcherError::invalid_request("Batch already executed"));
        }

        info!("Executing batch {} on batcher {}", batch.batch_id, batch.cn_batcher_id);
        let mut cn_result = self
            .gateway
            .batch_spend(BatchSpendRequest {
                batcher_id: batch.cn_batcher_id,
                conf_target: params.conf_target,
            })
            .await?;
        if cn_result.txid.is_empty() {
            return Err(BatcherError::Internal("An unknown error occurred".into()));
        }

        batch.spent_details = Some(
            serde_json::to_string(&cn_result).map_err(|e| BatcherError::Internal(e.to_string()))?,
        );
        batch.txid = Some(cn_result.txid.clone());
        batch.spent_timestamp = Some(Utc::now());
        let batch = self.store.save_batch(&batch).await?;
        info!("Batch {} broadcast as {}", batch.batch_id, cn_result.txid);

        cn_result.outputs = None;
        Ok(ExecuteBatchResult { batch, cn_result })
    }

    /// Batch with its requests, plus an ETA while it is still pending.
    pub async fn get_batch_details(&self, selector: BatchSelector) -> Result<BatchDetails> {
        let batch = self
            .resolve_batch(selector)
            .await?
            .ok_or_else(|| BatcherError::invalid_request("Batch not found"))?;
        let eta_seconds = (!batch.is_terminal()).then(|| self.clock.time_left_secs());
        Ok(BatchDetails {
            batch: self.with_requests(batch).await?,
            eta_seconds,
        })
    }

    /// Ongoing batch of a batcher (the default one when `None`), never created.
    pub async fn get_ongoing_batch(&self, cn_batcher_id: Option<i64>) -> Result<Option<BatchWithRequests>> {
        let cn_batcher_id = match cn_batcher_id {
            Some(id) => id,
            None => self.settings().await.default_batcher_id,
        };
        match self.store.find_ongoing_batch(cn_batcher_id).await? {
            Some(batch) => Ok(Some(self.with_requests(batch).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_ongoing_batches(&self) -> Result<Vec<BatchWithRequests>> {
        let mut batches = Vec::new();
        for batch in self.store.list_ongoing_batches().await? {
            batches.push(self.with_requests(batch).await?);
        }
        Ok(batches)
    }

    /// Relay a gateway output callback to every request sharing the output.
    ///
    /// Requests already called back, or without a webhook URL, are skipped.
    /// Only successfully notified requests are flagged, so a failed delivery
    /// is attempted again on the next callback.
    pub async fn process_webhooks(&self, callback: WebhookCallback) -> Result<WebhookReport> {
        let requests = self.store.find_requests_by_output_id(callback.output_id).await?;
        let first = requests.first().ok_or_else(|| {
            BatcherError::invalid_params(format!("No batch request for output {}", callback.output_id))
        })?;
        let batch = self
            .store
            .find_batch(first.batch_id)
            .await?
            .ok_or_else(|| BatcherError::Internal(format!("Batch {} missing", first.batch_id)))?;
        let request_count_in_batch = self.store.count_requests_in_batch(batch.batch_id).await?;

        let mut report = WebhookReport {
            output_id: callback.output_id,
            ..Default::default()
        };
        for mut request in requests {
            let Some(url) = request.webhook_url.clone() else {
                continue;
            };
            if request.calledback {
                debug!("Request {} already called back", request.batch_request_id);
                continue;
            }

            let notification = WebhookNotification {
                batch_request_id: request.batch_request_id,
                batch_id: batch.batch_id,
                cn_batcher_id: batch.cn_batcher_id,
                request_count_in_batch,
                status: callback.status.clone(),
                txid: callback.txid.clone(),
                hash: callback.hash.clone(),
                details: notification_details(callback.details.as_ref(), &request),
            };

            match self.notifier.notify(&url, &notification).await {
                Ok(()) => {
                    request.calledback = true;
                    request.calledback_timestamp = Some(Utc::now());
                    self.store.save_requests(std::slice::from_ref(&request)).await?;
                    report.notified.push(request.batch_request_id);
                }
                Err(err) => {
                    warn!("Webhook for request {} not delivered: {}", request.batch_request_id, err);
                    report.failed.push(request.batch_request_id);
                }
            }
        }

        info!(
            "Output {} callback: {} notified, {} failed",
            callback.output_id,
            report.notified.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn resolve_batch(&self, selector: BatchSelector) -> Result<Option<Batch>> {
        if let Some(batch_id) = selector.batch_id {
            return Ok(self.store.find_batch(batch_id).await?);
        }
        if let Some(batch_request_id) = selector.batch_request_id {
            return Ok(self.store.find_batch_by_request(batch_request_id).await?);
        }
        let default_batcher_id = self.settings().await.default_batcher_id;
        Ok(self.store.find_ongoing_batch(default_batcher_id).await?)
    }

    async fn ongoing_batch_or_create(&self, cn_batcher_id: i64) -> Result<Batch> {
        if let Some(batch) = self.store.find_ongoing_batch(cn_batcher_id).await? {
            return Ok(batch);
        }
        let batch = self.store.insert_batch(cn_batcher_id).await?;
        info!("Opened batch {} for batcher {}", batch.batch_id, cn_batcher_id);
        Ok(batch)
    }

    async fn with_requests(&self, batch: Batch) -> Result<BatchWithRequests> {
        let batch_requests = self.store.find_requests_in_batch(batch.batch_id).await?;
        Ok(BatchWithRequests { batch, batch_requests })
    }
}

fn registered_output(result: &AddToBatchResult) -> Result<i64> {
    result.output_id.ok_or_else(|| {
        error!("Gateway registration for batcher {} returned no output id", result.batcher_id);
        BatcherError::Internal("An unknown error occurred".into())
    })
}

/// Gateway details with the request's own address and amount.
fn notification_details(details: Option<&Value>, request: &BatchRequest) -> Value {
    let mut merged = match details {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    merged.insert("address".into(), json!(request.address));
    merged.insert("amount".into(), json!(request.amount.to_f64()));
    Value::Object(merged)
}
