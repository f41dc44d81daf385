//! Shared configuration, error types, IDs, search helpers and observability
//! primitives for flowsched crates.
//!
//! Architecture role:
//! - defines scheduler configuration passed across layers
//! - provides common [`SchedError`] / [`Result`] contracts
//! - hosts the bisection search and partition-unit grouping used by adaptive
//!   parallelism decisions
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`adaptive`]
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`search`]

pub mod adaptive;
pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod search;

pub use config::SchedulerConfig;
pub use error::{Result, SchedError};
pub use ids::*;
pub use metrics::{MetricsRegistry, global_metrics};
pub use search::{find_max_legal_value, find_min_legal_value};
