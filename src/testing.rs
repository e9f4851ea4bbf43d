//! In-process doubles for the gateway and the webhook notifier.

use crate::batch::{BatchingEngine, EngineSettings};
use crate::error::RpcError;
use crate::gateway::{
    AddToBatchRequest, AddToBatchResult, BatchSpendRequest, BatchSpendResult, GatewayError,
    GatewayResult, PaymentGateway, SpendRequest, SpendResult,
};
use crate::notify::{Notifier, NotifyError};
use crate::registry::InMemoryStore;
use crate::scheduler::BatchClock;
use crate::types::WebhookNotification;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Output registered with the fake gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeOutput {
    pub address: String,
    pub amount: Decimal,
    pub batcher_id: i64,
    pub label: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Default)]
struct GatewayState {
    next_output_id: i64,
    next_txid: u32,
    outputs: BTreeMap<i64, FakeOutput>,
    calls: Vec<String>,
    add_failures: VecDeque<GatewayError>,
    remove_failures: VecDeque<GatewayError>,
    spend_failures: VecDeque<GatewayError>,
    batch_spend_failures: VecDeque<GatewayError>,
    batch_spend_delay: Option<Duration>,
}

/// Gateway double keeping its batchers in memory.
///
/// Failures are queued per endpoint and consumed one call at a time.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_add(&self, err: GatewayError) {
        self.state.lock().unwrap().add_failures.push_back(err);
    }

    pub fn fail_next_remove(&self, err: GatewayError) {
        self.state.lock().unwrap().remove_failures.push_back(err);
    }

    pub fn fail_next_spend(&self, err: GatewayError) {
        self.state.lock().unwrap().spend_failures.push_back(err);
    }

    pub fn fail_next_batch_spend(&self, err: GatewayError) {
        self.state.lock().unwrap().batch_spend_failures.push_back(err);
    }

    /// Answer `batchspend` only `delay` after the batch was spent.
    pub fn delay_batch_spend(&self, delay: Duration) {
        self.state.lock().unwrap().batch_spend_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn outputs(&self) -> BTreeMap<i64, FakeOutput> {
        self.state.lock().unwrap().outputs.clone()
    }

    pub fn output(&self, output_id: i64) -> Option<FakeOutput> {
        self.state.lock().unwrap().outputs.get(&output_id).cloned()
    }

    fn spend_batcher(&self, request: BatchSpendRequest) -> (GatewayResult<BatchSpendResult>, Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("batchspend {}", request.batcher_id));
        let delay = state.batch_spend_delay;
        if let Some(err) = state.batch_spend_failures.pop_front() {
            return (Err(err), delay);
        }

        let spent: Vec<_> = state
            .outputs
            .iter()
            .filter(|(_, o)| o.batcher_id == request.batcher_id)
            .map(|(id, o)| json!({ "outputId": id, "address": o.address }))
            .collect();
        state.outputs.retain(|_, o| o.batcher_id != request.batcher_id);
        state.next_txid += 1;

        let mut batcher = Map::new();
        batcher.insert("batcherId".into(), json!(request.batcher_id));
        batcher.insert("nbOutputs".into(), json!(spent.len()));
        let result = BatchSpendResult {
            txid: format!("batchtx{}", state.next_txid),
            hash: Some(format!("batchhash{}", state.next_txid)),
            details: Some(json!({ "fee": 0.00001 })),
            outputs: Some(json!(spent)),
            batcher,
        };
        (Ok(result), delay)
    }

    fn batcher_result(state: &GatewayState, batcher_id: i64, output_id: Option<i64>) -> AddToBatchResult {
        let outputs: Vec<_> = state
            .outputs
            .values()
            .filter(|o| o.batcher_id == batcher_id)
            .collect();
        AddToBatchResult {
            batcher_id,
            output_id,
            nb_outputs: Some(outputs.len() as i64),
            oldest: None,
            total: Some(outputs.iter().map(|o| o.amount).sum()),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn add_to_batch(&self, request: AddToBatchRequest) -> GatewayResult<AddToBatchResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("addtobatch {} {}", request.address, request.amount));
        if let Some(err) = state.add_failures.pop_front() {
            return Err(err);
        }

        let batcher_id = request.batcher_id.unwrap_or(1);
        state.next_output_id += 1;
        let output_id = state.next_output_id;
        state.outputs.insert(
            output_id,
            FakeOutput {
                address: request.address,
                amount: request.amount,
                batcher_id,
                label: request.output_label,
                webhook_url: request.webhook_url,
            },
        );
        Ok(Self::batcher_result(&state, batcher_id, Some(output_id)))
    }

    async fn remove_from_batch(&self, output_id: i64) -> GatewayResult<AddToBatchResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("removefrombatch {}", output_id));
        if let Some(err) = state.remove_failures.pop_front() {
            return Err(err);
        }

        let removed = state
            .outputs
            .remove(&output_id)
            .ok_or_else(|| GatewayError::Rejected(RpcError::new(-32700, "Output not found")))?;
        Ok(Self::batcher_result(&state, removed.batcher_id, Some(output_id)))
    }

    async fn batch_spend(&self, request: BatchSpendRequest) -> GatewayResult<BatchSpendResult> {
        let (result, delay) = self.spend_batcher(request);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn spend(&self, request: SpendRequest) -> GatewayResult<SpendResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("spend {} {}", request.address, request.amount));
        if let Some(err) = state.spend_failures.pop_front() {
            return Err(err);
        }
        Ok(SpendResult {
            txid: "spendtx".into(),
            hash: Some("spendhash".into()),
            details: None,
        })
    }
}

#[derive(Default)]
struct NotifierState {
    failing: HashSet<String>,
    delivered: Vec<(String, WebhookNotification)>,
}

/// Notifier double recording deliveries; URLs marked failing answer HTTP 500.
#[derive(Default)]
pub struct FakeNotifier {
    state: Mutex<NotifierState>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_url(&self, url: &str) {
        self.state.lock().unwrap().failing.insert(url.to_string());
    }

    pub fn heal_url(&self, url: &str) {
        self.state.lock().unwrap().failing.remove(url);
    }

    pub fn delivered(&self) -> Vec<(String, WebhookNotification)> {
        self.state.lock().unwrap().delivered.clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, url: &str, notification: &WebhookNotification) -> Result<(), NotifyError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(url) {
            return Err(NotifyError::Status(500));
        }
        state.delivered.push((url.to_string(), notification.clone()));
        Ok(())
    }
}

pub const CALLBACK_URL: &str = "http://batcher:8000/webhooks";
pub const BATCH_WINDOW: Duration = Duration::from_secs(3600);

/// Engine wired to fresh doubles, with batcher 1 as the default.
pub struct Harness {
    pub engine: Arc<BatchingEngine>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<FakeNotifier>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<BatchClock>,
}

pub fn harness() -> Harness {
    let gateway = Arc::new(FakeGateway::new());
    let notifier = Arc::new(FakeNotifier::new());
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(BatchClock::new(BATCH_WINDOW));
    let engine = Arc::new(BatchingEngine::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        clock.clone(),
        EngineSettings {
            default_batcher_id: 1,
            callback_url: CALLBACK_URL.into(),
        },
    ));
    Harness {
        engine,
        gateway,
        notifier,
        store,
        clock,
    }
}
