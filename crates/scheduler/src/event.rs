//! Inputs to and outputs of the scheduling state machine.

use std::fmt;

use flowsched_common::adaptive::SubpartitionRange;
use flowsched_common::{RegionId, VertexId};
use serde::{Deserialize, Serialize};

/// Region lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionState {
    /// Waiting for blocking inputs or parallelism decisions.
    Unscheduled,
    /// Emitted to deployment.
    Scheduled,
    /// At least one stage reported running or finished.
    Running,
    /// Every stage finished.
    Finished,
    /// A stage failed.
    Failed,
    /// Canceled with the job.
    Canceled,
}

impl RegionState {
    pub const ALL: [RegionState; 6] = [
        Self::Unscheduled,
        Self::Scheduled,
        Self::Running,
        Self::Finished,
        Self::Failed,
        Self::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unscheduled => "unscheduled",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether `self -> to` is a legal lifecycle step.
    pub fn can_transition_to(self, to: RegionState) -> bool {
        use RegionState::*;
        matches!(
            (self, to),
            (Unscheduled, Scheduled)
                | (Unscheduled, Canceled)
                | (Scheduled, Running)
                | (Scheduled, Finished)
                | (Scheduled, Failed)
                | (Scheduled, Canceled)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered by the execution-monitoring layer, in real-time order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingEvent {
    /// Every instance of the stage finished. `subpartition_bytes[i][u]` is the
    /// byte size instance `i` wrote for partition unit `u`.
    VertexFinished {
        vertex: VertexId,
        #[serde(default)]
        subpartition_bytes: Vec<Vec<u64>>,
    },
    /// The stage's instances were deployed and started.
    VertexRunning { vertex: VertexId },
    /// The stage failed; the job is not recovered.
    VertexFailed { vertex: VertexId, reason: String },
    JobCanceled,
}

impl SchedulingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VertexFinished { .. } => "vertex_finished",
            Self::VertexRunning { .. } => "vertex_running",
            Self::VertexFailed { .. } => "vertex_failed",
            Self::JobCanceled => "job_canceled",
        }
    }
}

/// Resolved parallelism of one stage in a scheduled region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledVertex {
    pub vertex_id: VertexId,
    pub parallelism: u32,
    /// Partition-unit range per instance for adaptively decided stages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_ranges: Vec<SubpartitionRange>,
}

/// Decision handed to the deployment layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRegion {
    pub region_id: RegionId,
    pub vertices: Vec<ScheduledVertex>,
}

impl ScheduleRegion {
    pub fn parallelism_of(&self, vertex: VertexId) -> Option<u32> {
        self.vertices
            .iter()
            .find(|v| v.vertex_id == vertex)
            .map(|v| v.parallelism)
    }
}
