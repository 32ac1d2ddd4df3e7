//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and timeouts.
//!
//! ## Components
//! - **Logging**: Structured `tracing` subscriber setup
//! - **Metrics**: Thread-safe transport counters
//! - **Timeout**: Default durations and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
