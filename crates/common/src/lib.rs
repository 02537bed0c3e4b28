//! FrameBatch common library
//!
//! This crate contains the error type, configuration and metrics shared by
//! the FrameBatch crates.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{BackendOptions, DriverConfig, FunctionKind};
pub use error::{ErrorCategory, FrameBatchError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
