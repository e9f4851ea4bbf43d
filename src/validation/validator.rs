use crate::error::{BatcherError, Result};
use crate::types::{DequeueAndPayParams, QueueForNextBatchParams};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Smallest unit handled by the gateway is 1e-8.
pub const MAX_AMOUNT_DECIMALS: u32 = 8;

const BECH32_PREFIXES: [&str; 3] = ["bc", "tb", "bcrt"];

/// Precondition checks for engine operations.
pub struct Validator;

impl Validator {
    /// Validate a queue request
    /// Returns Ok(()) if valid, Err(InvalidRequest) otherwise
    pub fn validate_queue(params: &QueueForNextBatchParams) -> Result<()> {
        debug!("Validating queue request to {}", params.address);

        if params.address.trim().is_empty() {
            warn!("Queue request rejected: empty address");
            return Err(invalid_arguments());
        }
        validate_amount(params.amount)
    }

    pub fn validate_dequeue_and_pay(params: &DequeueAndPayParams) -> Result<()> {
        if params.batch_request_id <= 0 {
            warn!("dequeueAndPay rejected: missing batchRequestId");
            return Err(invalid_arguments());
        }
        if let Some(address) = &params.address
            && address.trim().is_empty()
        {
            return Err(invalid_arguments());
        }
        if let Some(amount) = params.amount {
            validate_amount(amount)?;
        }
        Ok(())
    }
}

/// Amounts must be positive and carry at most eight fractional digits.
pub fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        warn!("Amount rejected: {} is not positive", amount);
        return Err(invalid_arguments());
    }
    if amount.normalize().scale() > MAX_AMOUNT_DECIMALS {
        warn!("Amount rejected: {} has more than {} decimals", amount, MAX_AMOUNT_DECIMALS);
        return Err(invalid_arguments());
    }
    Ok(())
}

/// Lowercase bech32 addresses so that merge detection ignores case.
/// Base58 addresses are case-sensitive and are returned unchanged.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let lowercased = trimmed.to_lowercase();
    if BECH32_PREFIXES.iter().any(|p| lowercased.starts_with(p)) {
        lowercased
    } else {
        trimmed.to_string()
    }
}

fn invalid_arguments() -> BatcherError {
    BatcherError::invalid_request("Invalid arguments")
}
