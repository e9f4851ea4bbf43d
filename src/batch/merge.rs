//! Output merging rules
//!
//! A gateway batcher holds at most one output per address. When a second
//! request targets an address that already has a pending output, the output is
//! replaced by a single one paying the sum, and every request sharing it is
//! flagged as merged.

use crate::types::BatchRequest;
use crate::validation::MAX_AMOUNT_DECIMALS;
use rust_decimal::Decimal;

/// Sum of the recorded request amounts, at satoshi precision.
pub fn total_amount(requests: &[BatchRequest]) -> Decimal {
    requests
        .iter()
        .map(|br| br.amount)
        .sum::<Decimal>()
        .round_dp(MAX_AMOUNT_DECIMALS)
}

/// Amount of the output replacing `existing` once `extra` joins it.
pub fn merged_amount(existing: &[BatchRequest], extra: Decimal) -> Decimal {
    (total_amount(existing) + extra).round_dp(MAX_AMOUNT_DECIMALS)
}

/// Output label built from the descriptions of the requests sharing it.
///
/// Returns `None` when no request carries a description.
pub fn output_label(requests: &[BatchRequest], extra: Option<&str>) -> Option<String> {
    let label = requests
        .iter()
        .filter_map(|br| br.description.as_deref())
        .chain(extra)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    (!label.is_empty()).then_some(label)
}
