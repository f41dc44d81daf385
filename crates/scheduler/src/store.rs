//! Authoritative per-job record of stage parallelism.
//!
//! The store has exactly one writer, the job's scheduling strategy, which
//! holds it by `&mut`. Reporting callers read through [`ParallelismReader`]
//! handles. Every write publishes a complete new map through `arc-swap`, so a
//! reader sees either the map before or after a write, never a partially
//! written entry, and never blocks the writer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use flowsched_common::config::UPPER_BOUND_MAX_PARALLELISM;
use flowsched_common::{Result, SchedError, VertexId};
use flowsched_graph::{ParallelismBounds, ParallelismDecision};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Bounds plus decision for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelismInfo {
    pub bounds: ParallelismBounds,
    pub decision: ParallelismDecision,
}

impl ParallelismInfo {
    /// Info with a decided parallelism; rejects values outside `bounds`.
    pub fn decided(bounds: ParallelismBounds, parallelism: u32) -> Result<Self> {
        if !bounds.contains(parallelism) {
            return Err(SchedError::InvalidBounds(format!(
                "parallelism {parallelism} outside bounds {bounds}"
            )));
        }
        Ok(Self {
            bounds,
            decision: ParallelismDecision::Decided(parallelism),
        })
    }

    pub fn undetermined(bounds: ParallelismBounds) -> Self {
        Self {
            bounds,
            decision: ParallelismDecision::Undetermined,
        }
    }

    pub fn parallelism(&self) -> Option<u32> {
        self.decision.decided()
    }
}

/// Legality rule for changing a stage's max parallelism.
///
/// State is range-partitioned into `max` fixed partition units, so whether a
/// different max keeps unit ownership intact depends on the state backend's
/// partitioning scheme. Implementations encode that rule; the store only asks.
pub trait RescalePolicy: Send + Sync {
    fn can_rescale(&self, vertex: VertexId, info: &ParallelismInfo, desired_max: u32) -> bool;
}

impl<F> RescalePolicy for F
where
    F: Fn(VertexId, &ParallelismInfo, u32) -> bool + Send + Sync,
{
    fn can_rescale(&self, vertex: VertexId, info: &ParallelismInfo, desired_max: u32) -> bool {
        self(vertex, info, desired_max)
    }
}

/// Default rule: the new max must still cover `min` and any decided
/// parallelism, and stay within the global upper bound.
#[derive(Debug, Clone, Copy)]
pub struct BoundedRescalePolicy {
    pub upper_bound: u32,
}

impl Default for BoundedRescalePolicy {
    fn default() -> Self {
        Self {
            upper_bound: UPPER_BOUND_MAX_PARALLELISM,
        }
    }
}

impl RescalePolicy for BoundedRescalePolicy {
    fn can_rescale(&self, _vertex: VertexId, info: &ParallelismInfo, desired_max: u32) -> bool {
        let floor = info
            .parallelism()
            .unwrap_or(info.bounds.min())
            .max(info.bounds.min());
        desired_max >= floor && desired_max <= self.upper_bound
    }
}

type Entries = HashMap<VertexId, ParallelismInfo>;

/// Single-writer parallelism store for one job.
pub struct VertexParallelismStore {
    entries: Arc<ArcSwap<Entries>>,
    policy: Arc<dyn RescalePolicy>,
}

impl fmt::Debug for VertexParallelismStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VertexParallelismStore")
            .field("entries", &self.entries.load().len())
            .finish_non_exhaustive()
    }
}

impl Default for VertexParallelismStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VertexParallelismStore {
    pub fn new() -> Self {
        Self::with_policy(Arc::new(BoundedRescalePolicy::default()))
    }

    pub fn with_policy(policy: Arc<dyn RescalePolicy>) -> Self {
        Self {
            entries: Arc::new(ArcSwap::from_pointee(Entries::new())),
            policy,
        }
    }

    /// Register info for a stage. A stage is registered at most once.
    pub fn set_parallelism_info(&mut self, vertex: VertexId, info: ParallelismInfo) -> Result<()> {
        let current = self.entries.load_full();
        if let Some(existing) = current.get(&vertex) {
            return Err(SchedError::IllegalState(format!(
                "parallelism info for vertex {vertex} already registered as {existing:?}"
            )));
        }
        if let Some(p) = info.parallelism() {
            if !info.bounds.contains(p) {
                return Err(SchedError::InvalidBounds(format!(
                    "vertex {vertex}: parallelism {p} outside bounds {}",
                    info.bounds
                )));
            }
        }
        let mut next = (*current).clone();
        next.insert(vertex, info);
        self.entries.store(Arc::new(next));
        debug!(
            vertex = %vertex,
            bounds = %info.bounds,
            decision = ?info.decision,
            "parallelism info registered"
        );
        Ok(())
    }

    pub fn get_parallelism_info(&self, vertex: VertexId) -> Result<ParallelismInfo> {
        lookup(&self.entries.load(), vertex)
    }

    pub fn contains(&self, vertex: VertexId) -> bool {
        self.entries.load().contains_key(&vertex)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// Registered stages, ascending.
    pub fn vertex_ids(&self) -> Vec<VertexId> {
        let mut ids = self.entries.load().keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `desired_max` may replace the stage's current max.
    pub fn can_rescale_max_parallelism(&self, vertex: VertexId, desired_max: u32) -> Result<bool> {
        let info = self.get_parallelism_info(vertex)?;
        Ok(self.policy.can_rescale(vertex, &info, desired_max))
    }

    /// Replace the stage's max parallelism after the policy approved it.
    ///
    /// The decision is left untouched; only the bounds change.
    pub fn rescale_max_parallelism(
        &mut self,
        vertex: VertexId,
        desired_max: u32,
    ) -> Result<ParallelismInfo> {
        let info = self.get_parallelism_info(vertex)?;
        if !self.policy.can_rescale(vertex, &info, desired_max) {
            return Err(SchedError::IllegalState(format!(
                "cannot rescale max parallelism of vertex {vertex} from {} to {desired_max}",
                info.bounds.max()
            )));
        }
        let bounds = info.bounds.with_max(desired_max)?;
        if let Some(p) = info.parallelism() {
            if !bounds.contains(p) {
                return Err(SchedError::IllegalState(format!(
                    "vertex {vertex}: rescaled bounds {bounds} exclude decided parallelism {p}"
                )));
            }
        }
        let updated = ParallelismInfo { bounds, ..info };
        let mut next = (*self.entries.load_full()).clone();
        next.insert(vertex, updated);
        self.entries.store(Arc::new(next));
        info!(
            vertex = %vertex,
            from = info.bounds.max(),
            to = desired_max,
            "max parallelism rescaled"
        );
        Ok(updated)
    }

    /// Lock-free read handle for reporting callers.
    pub fn reader(&self) -> ParallelismReader {
        ParallelismReader {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Cloneable read-only view of a [`VertexParallelismStore`].
#[derive(Clone)]
pub struct ParallelismReader {
    entries: Arc<ArcSwap<Entries>>,
}

impl fmt::Debug for ParallelismReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelismReader")
            .field("entries", &self.entries.load().len())
            .finish()
    }
}

impl ParallelismReader {
    pub fn get_parallelism_info(&self, vertex: VertexId) -> Result<ParallelismInfo> {
        lookup(&self.entries.load(), vertex)
    }

    /// Consistent copy of every registered entry, ordered by vertex id.
    pub fn snapshot(&self) -> Vec<(VertexId, ParallelismInfo)> {
        let entries = self.entries.load_full();
        let mut out = entries.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
        out.sort_by_key(|(k, _)| *k);
        out
    }
}

fn lookup(entries: &Entries, vertex: VertexId) -> Result<ParallelismInfo> {
    entries
        .get(&vertex)
        .copied()
        .ok_or_else(|| SchedError::NotFound(format!("no parallelism info for vertex {vertex}")))
}
