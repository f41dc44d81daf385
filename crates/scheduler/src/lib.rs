//! Adaptive-parallelism region scheduling.
//!
//! Architecture role:
//! - [`store`]: single-writer record of every stage's bounds and decided
//!   parallelism, with lock-free readers
//! - [`decider`]: picks a consumer stage's parallelism from the byte sizes
//!   its blocking producers wrote
//! - [`strategy`]: per-job state machine that emits regions once their
//!   blocking inputs finished
//! - [`coordinator`]: multi-job front-end, optionally running as a tokio actor
//!
//! Events go in through [`SchedulingEvent`]; decisions come out as
//! [`ScheduleRegion`] batches.

pub mod coordinator;
pub mod decider;
pub mod event;
pub mod store;
pub mod strategy;

pub use coordinator::{ChannelDeploymentSink, CoordinatorHandle, DeploymentSink, JobCoordinator};
pub use decider::{DecisionOutcome, DecisionReason, ParallelismDecider};
pub use event::{RegionState, ScheduleRegion, ScheduledVertex, SchedulingEvent};
pub use store::{
    BoundedRescalePolicy, ParallelismInfo, ParallelismReader, RescalePolicy,
    VertexParallelismStore,
};
pub use strategy::{JobState, JobStatus, RegionStatus, SchedulingStrategy, StrategyKind};
