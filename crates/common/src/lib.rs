//! ClusterLoop common library
//!
//! This crate contains the error taxonomy, configuration and metrics shared
//! by ClusterLoop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::NodeConfig;
pub use error::{ClusterLoopError, Result};
pub use metrics::{MetricsRegistry, METRICS};
