//! Adaptive parallelism decisions for stages behind blocking edges.
//!
//! The decider picks the smallest parallelism within a stage's bounds such
//! that no consumer instance reads more than the target bytes, given the
//! byte size of every partition unit its producers wrote. When even the max
//! cannot get under the target, the max is used and the imbalance accepted.

use flowsched_common::adaptive::{
    PartitionBytesHistogramBucket, SubpartitionRange, balanced_ranges, build_unit_bytes_histogram,
    max_range_size,
};
use flowsched_common::metrics::global_metrics;
use flowsched_common::{JobId, Result, SchedulerConfig, VertexId, find_min_legal_value};
use flowsched_graph::ParallelismBounds;
use serde::Serialize;
use tracing::info;

use crate::store::{ParallelismInfo, VertexParallelismStore};

/// Why a stage got the parallelism it got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Smallest parallelism keeping every instance at or under the target.
    Fitted,
    /// Even the max leaves some instance above the target.
    ClampedToMax,
    /// Producers wrote no data.
    EmptyInput,
    /// Copied from a pipelined producer, clamped to bounds.
    Inherited,
    /// Source stage without statistics.
    SourceDefault,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fitted => "fitted",
            Self::ClampedToMax => "clamped_to_max",
            Self::EmptyInput => "empty_input",
            Self::Inherited => "inherited",
            Self::SourceDefault => "source_default",
        }
    }
}

/// Result of one decision, kept for deployment and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionOutcome {
    pub vertex: VertexId,
    pub parallelism: u32,
    pub reason: DecisionReason,
    /// Bytes across every partition unit considered.
    pub total_bytes: u64,
    /// Largest per-instance byte count under the chosen parallelism.
    pub max_range_bytes: u64,
    /// Unit range read by each instance; empty when no statistics were used.
    pub input_ranges: Vec<SubpartitionRange>,
    pub unit_bytes_histogram: Vec<PartitionBytesHistogramBucket>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelismDecider {
    target_bytes: u64,
}

impl ParallelismDecider {
    /// `target_bytes` is clamped to at least one byte.
    pub fn new(target_bytes: u64) -> Self {
        Self {
            target_bytes: target_bytes.max(1),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.target_bytes_per_instance)
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    /// Pure decision over aggregated unit sizes. Always within `bounds`.
    pub fn compute(&self, units: &[u64], bounds: ParallelismBounds) -> (u32, DecisionReason) {
        if units.iter().all(|b| *b == 0) {
            return (bounds.min(), DecisionReason::EmptyInput);
        }
        let target = self.target_bytes;
        match find_min_legal_value(
            |k: u32| max_range_size(units, k) <= target,
            bounds.min(),
            bounds.max(),
        ) {
            Some(k) => (k, DecisionReason::Fitted),
            None => (bounds.max(), DecisionReason::ClampedToMax),
        }
    }

    /// Decide from producer statistics and register the result in `store`.
    pub fn decide(
        &self,
        job_id: JobId,
        vertex: VertexId,
        bounds: ParallelismBounds,
        units: &[u64],
        store: &mut VertexParallelismStore,
    ) -> Result<DecisionOutcome> {
        let (parallelism, reason) = self.compute(units, bounds);
        let total_bytes = units.iter().fold(0_u64, |acc, b| acc.saturating_add(*b));
        let outcome = DecisionOutcome {
            vertex,
            parallelism,
            reason,
            total_bytes,
            max_range_bytes: max_range_size(units, parallelism),
            input_ranges: if units.is_empty() {
                Vec::new()
            } else {
                balanced_ranges(units, parallelism)
            },
            unit_bytes_histogram: build_unit_bytes_histogram(units),
        };
        self.register(job_id, bounds, outcome, store)
    }

    /// Register a decision that does not come from statistics (inherited or
    /// source default). `parallelism` is clamped to `bounds`.
    pub fn decide_without_statistics(
        &self,
        job_id: JobId,
        vertex: VertexId,
        bounds: ParallelismBounds,
        parallelism: u32,
        reason: DecisionReason,
        store: &mut VertexParallelismStore,
    ) -> Result<DecisionOutcome> {
        let outcome = DecisionOutcome {
            vertex,
            parallelism: bounds.clamp(parallelism),
            reason,
            total_bytes: 0,
            max_range_bytes: 0,
            input_ranges: Vec::new(),
            unit_bytes_histogram: Vec::new(),
        };
        self.register(job_id, bounds, outcome, store)
    }

    fn register(
        &self,
        job_id: JobId,
        bounds: ParallelismBounds,
        outcome: DecisionOutcome,
        store: &mut VertexParallelismStore,
    ) -> Result<DecisionOutcome> {
        store.set_parallelism_info(
            outcome.vertex,
            ParallelismInfo::decided(bounds, outcome.parallelism)?,
        )?;
        global_metrics().record_parallelism_decision(
            &job_id.to_string(),
            outcome.reason.as_str(),
            outcome.parallelism,
            outcome.total_bytes,
        );
        info!(
            job_id = %job_id,
            vertex = %outcome.vertex,
            parallelism = outcome.parallelism,
            bounds = %bounds,
            reason = outcome.reason.as_str(),
            total_bytes = outcome.total_bytes,
            max_range_bytes = outcome.max_range_bytes,
            target_bytes = self.target_bytes,
            operator = "ParallelismDecider",
            "parallelism decided"
        );
        Ok(outcome)
    }
}
