//! Probe execution
//!
//! Dispatches probes according to their declared hazard: fault containment,
//! deadline enforcement and privilege-miss handling.

pub mod context;

pub use context::{ExecutionContext, DEFAULT_SLACK};
