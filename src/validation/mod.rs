//! Request Validation Module
//!
//! This module checks engine preconditions before any outbound call is made.
//! Rejected inputs never reach the gateway or the store.

mod validator;
pub use validator::{normalize_address, validate_amount, Validator, MAX_AMOUNT_DECIMALS};
