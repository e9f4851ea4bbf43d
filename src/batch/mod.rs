//! Batch Management Module
//!
//! This module handles queuing payments into gateway batchers:
//! - BatchingEngine: every batch and batch request state transition
//! - merge: rules for folding same-address requests into one output

mod engine;
pub mod merge;

pub use engine::{BatchingEngine, EngineSettings};
