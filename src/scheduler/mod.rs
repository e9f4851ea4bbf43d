//! Batch Scheduling Module
//!
//! This module decides when batches are executed without a caller asking:
//! - BatchClock: reference clock of the current batching window
//! - Scheduler: background tasks running the timeout and threshold triggers
//!
//! Any execution started by a trigger resets the window.

mod clock;
mod scheduler;
mod trigger;


pub use clock::BatchClock;
pub use scheduler::Scheduler;
pub use trigger::{on_threshold_check, on_timeout};
