//! Region scheduling state machine for one job.
//!
//! Responsibilities:
//! - partition the job into regions once, at admission;
//! - register fixed parallelisms and emit the initial regions on `start`;
//! - consume execution events in arrival order and emit every region whose
//!   blocking inputs became satisfied, after deciding the parallelism of its
//!   undetermined stages;
//! - track region lifecycle and the job's terminal state.
//!
//! Region lifecycle:
//! `Unscheduled -> Scheduled -> Running -> Finished`, with `Failed` and
//! `Canceled` reachable from every non-terminal state. Any other step is an
//! `IllegalState` violation and fails the job fast at the caller.
//!
//! Producer statistics are held only while some undetermined consumer still
//! needs them and are dropped as soon as the last one is decided.

use std::collections::HashMap;
use std::sync::Arc;

use flowsched_common::adaptive::aggregate_unit_bytes;
use flowsched_common::metrics::global_metrics;
use flowsched_common::{JobId, RegionId, Result, SchedError, SchedulerConfig, VertexId};
use flowsched_graph::{ExecutionMode, JobGraph, ParallelismDecision, RegionGraph, RegionPartitioner};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::decider::{DecisionOutcome, DecisionReason, ParallelismDecider};
use crate::event::{RegionState, ScheduleRegion, ScheduledVertex, SchedulingEvent};
use crate::store::{
    BoundedRescalePolicy, ParallelismInfo, ParallelismReader, VertexParallelismStore,
};

/// Scheduling variant, chosen once from the job's [`ExecutionMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Batch: a region is emitted once all its blocking producers finished.
    PipelinedRegion,
    /// Streaming: every region is emitted at start.
    AllAtOnce,
}

impl StrategyKind {
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Batch => Self::PipelinedRegion,
            ExecutionMode::Streaming => Self::AllAtOnce,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelinedRegion => "pipelined_region",
            Self::AllAtOnce => "all_at_once",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionStatus {
    pub region_id: RegionId,
    pub state: RegionState,
    pub vertices: Vec<VertexId>,
}

/// Point-in-time view of a job's scheduling progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: StrategyKind,
    pub state: JobState,
    /// Failure or cancellation detail; empty while running.
    pub message: String,
    pub regions: Vec<RegionStatus>,
    /// Regions that left `Unscheduled`.
    pub scheduled_regions: usize,
    pub finished_regions: usize,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn region_state(&self, region_id: RegionId) -> Option<RegionState> {
        self.regions
            .iter()
            .find(|r| r.region_id == region_id)
            .map(|r| r.state)
    }
}

/// Event-driven scheduler of one job's regions.
#[derive(Debug)]
pub struct SchedulingStrategy {
    job_id: JobId,
    kind: StrategyKind,
    graph: Arc<JobGraph>,
    regions: Arc<RegionGraph>,
    store: VertexParallelismStore,
    decider: ParallelismDecider,
    default_source_parallelism: u32,
    region_states: Vec<RegionState>,
    finished_in_region: Vec<usize>,
    vertex_finished: Vec<bool>,
    vertex_running: Vec<bool>,
    /// Aggregated unit bytes per finished producer, kept while consumers wait.
    statistics: HashMap<VertexId, Vec<u64>>,
    /// Undetermined cross-region blocking consumers per producer.
    pending_consumers: HashMap<VertexId, usize>,
    decisions: HashMap<VertexId, DecisionOutcome>,
    state: JobState,
    message: String,
    started: bool,
}

impl SchedulingStrategy {
    pub fn new(job_id: JobId, graph: Arc<JobGraph>, config: &SchedulerConfig) -> Result<Self> {
        let store = VertexParallelismStore::with_policy(Arc::new(BoundedRescalePolicy {
            upper_bound: config.upper_bound_max_parallelism,
        }));
        Self::with_store(job_id, graph, config, store)
    }

    /// Admit a job with a caller-provided (empty) store, e.g. to plug a
    /// custom rescale policy.
    pub fn with_store(
        job_id: JobId,
        graph: Arc<JobGraph>,
        config: &SchedulerConfig,
        store: VertexParallelismStore,
    ) -> Result<Self> {
        if !store.is_empty() {
            return Err(SchedError::IllegalState(format!(
                "job {job_id}: parallelism store already holds {} entries",
                store.len()
            )));
        }
        let kind = StrategyKind::for_mode(graph.mode());
        let regions = Arc::new(RegionPartitioner.partition(&graph));

        let mut pending_consumers = HashMap::<VertexId, usize>::new();
        for edge in graph.edges() {
            if !edge.kind.is_blocking() || !regions.is_cross_region(edge) {
                continue;
            }
            // Streaming regions all deploy at start.
            if kind == StrategyKind::AllAtOnce {
                return Err(SchedError::InvalidGraph(format!(
                    "job {job_id}: streaming job has blocking edge {} -> {} across regions",
                    edge.producer, edge.consumer
                )));
            }
            if graph.vertex(edge.consumer)?.decision.is_decided() {
                continue;
            }
            *pending_consumers.entry(edge.producer).or_default() += 1;
        }

        info!(
            job_id = %job_id,
            strategy = kind.as_str(),
            vertices = graph.len(),
            regions = regions.len(),
            operator = "SchedulingStrategy",
            "job admitted"
        );
        Ok(Self {
            job_id,
            kind,
            region_states: vec![RegionState::Unscheduled; regions.len()],
            finished_in_region: vec![0; regions.len()],
            vertex_finished: vec![false; graph.len()],
            vertex_running: vec![false; graph.len()],
            graph,
            regions,
            store,
            decider: ParallelismDecider::from_config(config),
            default_source_parallelism: config.default_source_parallelism,
            statistics: HashMap::new(),
            pending_consumers,
            decisions: HashMap::new(),
            state: JobState::Running,
            message: String::new(),
            started: false,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn region_graph(&self) -> &RegionGraph {
        &self.regions
    }

    pub fn store(&self) -> &VertexParallelismStore {
        &self.store
    }

    pub fn parallelism_reader(&self) -> ParallelismReader {
        self.store.reader()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn region_state(&self, region_id: RegionId) -> Result<RegionState> {
        self.region_states
            .get(region_id.index())
            .copied()
            .ok_or_else(|| SchedError::NotFound(format!("region {region_id}")))
    }

    /// Decision made by this strategy for `vertex`; `None` for fixed or
    /// not yet decided stages.
    pub fn decision(&self, vertex: VertexId) -> Option<&DecisionOutcome> {
        self.decisions.get(&vertex)
    }

    /// True while finished statistics of `producer` are retained.
    pub fn has_statistics(&self, producer: VertexId) -> bool {
        self.statistics.contains_key(&producer)
    }

    pub fn can_rescale_max_parallelism(&self, vertex: VertexId, desired_max: u32) -> Result<bool> {
        self.store.can_rescale_max_parallelism(vertex, desired_max)
    }

    pub fn rescale_max_parallelism(
        &mut self,
        vertex: VertexId,
        desired_max: u32,
    ) -> Result<ParallelismInfo> {
        self.store.rescale_max_parallelism(vertex, desired_max)
    }

    /// Register fixed parallelisms and emit the initial regions.
    pub fn start(&mut self) -> Result<Vec<ScheduleRegion>> {
        if self.started {
            return Err(SchedError::IllegalState(format!(
                "job {} already started",
                self.job_id
            )));
        }
        self.started = true;
        for vertex in self.graph.vertices() {
            if let ParallelismDecision::Decided(p) = vertex.decision {
                self.store
                    .set_parallelism_info(vertex.id, ParallelismInfo::decided(vertex.bounds, p)?)?;
            }
        }
        self.publish_region_gauges();

        let initial = match self.kind {
            StrategyKind::PipelinedRegion => self.regions.source_regions().collect::<Vec<_>>(),
            StrategyKind::AllAtOnce => self.regions.regions().iter().map(|r| r.id).collect(),
        };
        let batch = initial
            .into_iter()
            .map(|region_id| self.schedule_region(region_id))
            .collect::<Result<Vec<_>>>()?;
        self.finish_if_complete();
        Ok(batch)
    }

    /// Apply one event and return the regions that became ready, ascending.
    ///
    /// Events for a failed or canceled job are ignored.
    pub fn on_event(&mut self, event: SchedulingEvent) -> Result<Vec<ScheduleRegion>> {
        global_metrics().inc_scheduling_events(&self.job_id.to_string(), event.kind());
        if !self.started {
            return Err(SchedError::IllegalState(format!(
                "job {}: {} before start",
                self.job_id,
                event.kind()
            )));
        }
        if matches!(self.state, JobState::Failed | JobState::Canceled) {
            debug!(
                job_id = %self.job_id,
                event = event.kind(),
                state = self.state.as_str(),
                "event ignored"
            );
            return Ok(Vec::new());
        }
        match event {
            SchedulingEvent::VertexFinished {
                vertex,
                subpartition_bytes,
            } => self.on_vertex_finished(vertex, &subpartition_bytes),
            SchedulingEvent::VertexRunning { vertex } => {
                self.on_vertex_running(vertex)?;
                Ok(Vec::new())
            }
            SchedulingEvent::VertexFailed { vertex, reason } => {
                self.on_vertex_failed(vertex, &reason)?;
                Ok(Vec::new())
            }
            SchedulingEvent::JobCanceled => {
                self.cancel();
                Ok(Vec::new())
            }
        }
    }

    fn on_vertex_finished(
        &mut self,
        vertex: VertexId,
        subpartition_bytes: &[Vec<u64>],
    ) -> Result<Vec<ScheduleRegion>> {
        let region_id = self.owning_region(vertex)?;
        if self.vertex_finished[vertex.index()] {
            return Err(SchedError::IllegalState(format!(
                "duplicate finish for vertex {vertex}"
            )));
        }
        let state = self.region_states[region_id.index()];
        match state {
            RegionState::Scheduled | RegionState::Running => {}
            RegionState::Unscheduled => {
                return Err(SchedError::IllegalState(format!(
                    "vertex {vertex} finished but region {region_id} was never scheduled"
                )));
            }
            other => {
                return Err(SchedError::IllegalState(format!(
                    "vertex {vertex} finished in {other} region {region_id}"
                )));
            }
        }
        self.vertex_finished[vertex.index()] = true;
        self.finished_in_region[region_id.index()] += 1;
        if state == RegionState::Scheduled {
            self.transition(region_id, RegionState::Running)?;
        }
        self.record_statistics(vertex, subpartition_bytes);
        debug!(
            job_id = %self.job_id,
            vertex = %vertex,
            region_id = %region_id,
            instances = subpartition_bytes.len(),
            "vertex finished"
        );

        let regions = Arc::clone(&self.regions);
        let region = regions.region(region_id)?;
        if self.finished_in_region[region_id.index()] < region.vertices.len() {
            return Ok(Vec::new());
        }
        self.transition(region_id, RegionState::Finished)?;
        info!(
            job_id = %self.job_id,
            region_id = %region_id,
            operator = "SchedulingStrategy",
            "region finished"
        );
        self.finish_if_complete();
        self.schedule_ready(&region.consumer_regions)
    }

    fn on_vertex_running(&mut self, vertex: VertexId) -> Result<()> {
        let region_id = self.owning_region(vertex)?;
        let state = self.region_states[region_id.index()];
        if !matches!(state, RegionState::Scheduled | RegionState::Running) {
            return Err(SchedError::IllegalState(format!(
                "vertex {vertex} reported running in {state} region {region_id}"
            )));
        }
        if self.vertex_running[vertex.index()] || self.vertex_finished[vertex.index()] {
            return Err(SchedError::IllegalState(format!(
                "duplicate running notification for vertex {vertex}"
            )));
        }
        self.vertex_running[vertex.index()] = true;
        if state == RegionState::Scheduled {
            self.transition(region_id, RegionState::Running)?;
        }
        Ok(())
    }

    fn on_vertex_failed(&mut self, vertex: VertexId, reason: &str) -> Result<()> {
        let region_id = self.owning_region(vertex)?;
        let state = self.region_states[region_id.index()];
        if !matches!(state, RegionState::Scheduled | RegionState::Running)
            || self.vertex_finished[vertex.index()]
        {
            return Err(SchedError::IllegalState(format!(
                "vertex {vertex} failed in {state} region {region_id}"
            )));
        }
        self.transition(region_id, RegionState::Failed)?;
        self.cancel_remaining()?;
        self.state = JobState::Failed;
        self.message = format!("vertex {vertex} failed: {reason}");
        warn!(
            job_id = %self.job_id,
            vertex = %vertex,
            region_id = %region_id,
            reason,
            operator = "SchedulingStrategy",
            "job failed"
        );
        Ok(())
    }

    /// Cancel every non-terminal region. No-op on a terminal job.
    pub fn cancel(&mut self) -> JobState {
        if self.state.is_terminal() {
            return self.state;
        }
        if let Err(e) = self.cancel_remaining() {
            warn!(job_id = %self.job_id, error = %e, "cancel left regions behind");
        }
        self.state = JobState::Canceled;
        self.message = "canceled".to_string();
        info!(job_id = %self.job_id, operator = "SchedulingStrategy", "job canceled");
        self.state
    }

    /// Fail the job after an invariant violation. No-op on a terminal job.
    pub fn abort(&mut self, message: &str) -> JobState {
        if self.state.is_terminal() {
            return self.state;
        }
        if let Err(e) = self.cancel_remaining() {
            warn!(job_id = %self.job_id, error = %e, "abort left regions behind");
        }
        self.state = JobState::Failed;
        self.message = message.to_string();
        self.state
    }

    /// Emit `region_id` after resolving its undetermined stages.
    ///
    /// Fails with `IllegalState` when the job is terminal, the region was
    /// already scheduled, or a blocking producer region has not finished.
    pub fn schedule_region(&mut self, region_id: RegionId) -> Result<ScheduleRegion> {
        if self.state.is_terminal() {
            return Err(SchedError::IllegalState(format!(
                "job {} is {}; cannot schedule region {region_id}",
                self.job_id,
                self.state.as_str()
            )));
        }
        let regions = Arc::clone(&self.regions);
        let region = regions.region(region_id)?;
        let state = self.region_states[region_id.index()];
        if state != RegionState::Unscheduled {
            return Err(SchedError::IllegalState(format!(
                "region {region_id} already {state}"
            )));
        }
        if !self.inputs_finished(region_id)? {
            return Err(SchedError::IllegalState(format!(
                "region {region_id} has unfinished blocking producers"
            )));
        }
        let vertices = region
            .vertices
            .iter()
            .map(|v| self.resolve_vertex(*v))
            .collect::<Result<Vec<_>>>()?;
        self.transition(region_id, RegionState::Scheduled)?;
        global_metrics().inc_regions_scheduled(&self.job_id.to_string(), 1);
        info!(
            job_id = %self.job_id,
            region_id = %region_id,
            vertices = vertices.len(),
            operator = "SchedulingStrategy",
            "region scheduled"
        );
        Ok(ScheduleRegion {
            region_id,
            vertices,
        })
    }

    pub fn status(&self) -> JobStatus {
        let regions = self
            .regions
            .regions()
            .iter()
            .map(|r| RegionStatus {
                region_id: r.id,
                state: self.region_states[r.id.index()],
                vertices: r.vertices.clone(),
            })
            .collect::<Vec<_>>();
        JobStatus {
            job_id: self.job_id,
            kind: self.kind,
            state: self.state,
            message: self.message.clone(),
            scheduled_regions: regions
                .iter()
                .filter(|r| r.state != RegionState::Unscheduled)
                .count(),
            finished_regions: regions
                .iter()
                .filter(|r| r.state == RegionState::Finished)
                .count(),
            regions,
        }
    }

    fn schedule_ready(&mut self, candidates: &[RegionId]) -> Result<Vec<ScheduleRegion>> {
        let mut batch = Vec::new();
        for &region_id in candidates {
            if self.region_states[region_id.index()] != RegionState::Unscheduled {
                continue;
            }
            if self.inputs_finished(region_id)? {
                batch.push(self.schedule_region(region_id)?);
            }
        }
        Ok(batch)
    }

    fn inputs_finished(&self, region_id: RegionId) -> Result<bool> {
        Ok(self
            .regions
            .region(region_id)?
            .producer_regions
            .iter()
            .all(|p| self.region_states[p.index()] == RegionState::Finished))
    }

    fn resolve_vertex(&mut self, vertex: VertexId) -> Result<ScheduledVertex> {
        if self.store.contains(vertex) {
            let info = self.store.get_parallelism_info(vertex)?;
            let parallelism = info.parallelism().ok_or_else(|| {
                SchedError::IllegalState(format!("vertex {vertex} registered without a decision"))
            })?;
            return Ok(ScheduledVertex {
                vertex_id: vertex,
                parallelism,
                input_ranges: Vec::new(),
            });
        }

        let graph = Arc::clone(&self.graph);
        let bounds = graph.vertex(vertex)?.bounds;
        let blocking_producers = graph
            .inputs(vertex)
            .filter(|e| e.kind.is_blocking() && self.regions.is_cross_region(e))
            .map(|e| e.producer)
            .collect::<Vec<_>>();

        let outcome = if !blocking_producers.is_empty() {
            let units = aggregate_unit_bytes(
                blocking_producers
                    .iter()
                    .map(|p| self.statistics.get(p).map(Vec::as_slice).unwrap_or_default()),
            );
            let outcome = self
                .decider
                .decide(self.job_id, vertex, bounds, &units, &mut self.store)?;
            self.release_statistics(&blocking_producers);
            outcome
        } else if let Some(p) = graph
            .inputs(vertex)
            .find_map(|e| self.store.get_parallelism_info(e.producer).ok()?.parallelism())
        {
            self.decider.decide_without_statistics(
                self.job_id,
                vertex,
                bounds,
                p,
                DecisionReason::Inherited,
                &mut self.store,
            )?
        } else {
            self.decider.decide_without_statistics(
                self.job_id,
                vertex,
                bounds,
                self.default_source_parallelism,
                DecisionReason::SourceDefault,
                &mut self.store,
            )?
        };

        let scheduled = ScheduledVertex {
            vertex_id: vertex,
            parallelism: outcome.parallelism,
            input_ranges: outcome.input_ranges.clone(),
        };
        self.decisions.insert(vertex, outcome);
        Ok(scheduled)
    }

    fn record_statistics(&mut self, producer: VertexId, subpartition_bytes: &[Vec<u64>]) {
        if !self.pending_consumers.contains_key(&producer) {
            return;
        }
        let units = aggregate_unit_bytes(subpartition_bytes.iter().map(Vec::as_slice));
        self.statistics.insert(producer, units);
    }

    fn release_statistics(&mut self, producers: &[VertexId]) {
        for producer in producers {
            let Some(pending) = self.pending_consumers.get_mut(producer) else {
                continue;
            };
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.pending_consumers.remove(producer);
                if self.statistics.remove(producer).is_some() {
                    debug!(job_id = %self.job_id, vertex = %producer, "statistics released");
                }
            }
        }
    }

    fn owning_region(&self, vertex: VertexId) -> Result<RegionId> {
        self.graph.vertex(vertex)?;
        self.regions.region_of(vertex)
    }

    fn cancel_remaining(&mut self) -> Result<()> {
        for idx in 0..self.region_states.len() {
            if !self.region_states[idx].is_terminal() {
                self.transition(RegionId(idx as u32), RegionState::Canceled)?;
            }
        }
        self.statistics.clear();
        self.pending_consumers.clear();
        Ok(())
    }

    fn finish_if_complete(&mut self) {
        if self.state.is_terminal()
            || self
                .region_states
                .iter()
                .any(|s| *s != RegionState::Finished)
        {
            return;
        }
        self.state = JobState::Finished;
        info!(job_id = %self.job_id, operator = "SchedulingStrategy", "job finished");
    }

    fn transition(&mut self, region_id: RegionId, to: RegionState) -> Result<()> {
        let from = self.region_states[region_id.index()];
        if !from.can_transition_to(to) {
            return Err(SchedError::IllegalState(format!(
                "region {region_id}: illegal transition {from} -> {to}"
            )));
        }
        self.region_states[region_id.index()] = to;
        debug!(
            job_id = %self.job_id,
            region_id = %region_id,
            from = from.as_str(),
            to = to.as_str(),
            "region transition"
        );
        self.publish_region_gauges();
        Ok(())
    }

    fn publish_region_gauges(&self) {
        let job = self.job_id.to_string();
        for state in RegionState::ALL {
            let n = self.region_states.iter().filter(|s| **s == state).count();
            global_metrics().set_region_state_count(&job, state.as_str(), n as u64);
        }
    }
}
