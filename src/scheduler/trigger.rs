//! Batch Trigger Module
//!
//! Decides when the ongoing batch of the default batcher is executed without
//! a caller asking for it:
//! - Timeout trigger: once per window, whatever the batch holds
//! - Threshold trigger: as soon as the batch total reaches the configured amount
//!
//! Both reset the batch clock before executing, so an early execution starts
//! a full new window.

use super::BatchClock;
use crate::batch::BatchingEngine;
use crate::types::{ExecuteBatchParams, ExecuteBatchResult};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Execute the ongoing batch because its window elapsed.
///
/// # Arguments
/// * `engine` - Engine executing the default batcher's ongoing batch
/// * `clock` - Window clock, restarted before the execution
/// * `conf_target` - Confirmation target passed to the gateway
///
/// # Returns
/// The execution result, or `None` when nothing was executed
pub async fn on_timeout(
    engine: &BatchingEngine,
    clock: &BatchClock,
    conf_target: Option<u32>,
) -> Option<ExecuteBatchResult> {
    info!("Batch window elapsed, executing ongoing batch");
    clock.reset();
    execute(engine, conf_target).await
}

/// Execute the ongoing batch early if its total reached `threshold`.
pub async fn on_threshold_check(
    engine: &BatchingEngine,
    clock: &BatchClock,
    threshold: Decimal,
    conf_target: Option<u32>,
) -> Option<ExecuteBatchResult> {
    let ongoing = match engine.get_ongoing_batch(None).await {
        Ok(Some(batch)) => batch,
        Ok(None) => {
            debug!("Threshold check: no ongoing batch");
            return None;
        }
        Err(e) => {
            warn!("Threshold check failed: {}", e);
            return None;
        }
    };

    // Compare recorded request amounts, not the gateway's output total
    let total = ongoing.total_amount();
    if total < threshold {
        debug!(
            "Threshold check: batch {} holds {} of {}",
            ongoing.batch.batch_id, total, threshold
        );
        return None;
    }

    info!(
        "Batch {} reached {} (threshold {}), executing early",
        ongoing.batch.batch_id, total, threshold
    );
    clock.reset();
    execute(engine, conf_target).await
}

async fn execute(engine: &BatchingEngine, conf_target: Option<u32>) -> Option<ExecuteBatchResult> {
    let params = ExecuteBatchParams {
        conf_target,
        ..Default::default()
    };
    match engine.execute_batch(params).await {
        Ok(result) => {
            info!(
                "Scheduled execution of batch {} broadcast as {}",
                result.batch.batch_id, result.cn_result.txid
            );
            Some(result)
        }
        Err(e) => {
            // An empty window is the common case
            debug!("Scheduled execution skipped: {}", e);
            None
        }
    }
}
