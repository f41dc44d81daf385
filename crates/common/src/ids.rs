//! Typed identifiers shared across graph/scheduler components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Stable vertex (stage) identifier within a job graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(
    /// Raw numeric id value.
    pub u32,
);

impl VertexId {
    /// Arena index of this vertex.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Region identifier, assigned by the region partitioner in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(
    /// Raw numeric id value.
    pub u32,
);

impl RegionId {
    /// Arena index of this region.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_with_prefix() {
        assert_eq!(JobId(7).to_string(), "job-7");
        assert_eq!(VertexId(3).to_string(), "v3");
        assert_eq!(RegionId(0).to_string(), "r0");
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&VertexId(12)).expect("encode");
        assert_eq!(json, "12");
        let back: RegionId = serde_json::from_str("4").expect("decode");
        assert_eq!(back, RegionId(4));
    }
}
