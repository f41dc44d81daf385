//! Job graph model and pipelined-region partitioning.
//!
//! A [`JobGraph`] is submitted once per job and validated on construction.
//! [`RegionPartitioner::partition`] then groups its stages into scheduling regions; the
//! result is static for the job's lifetime.

pub mod job_graph;
pub mod region;

pub use job_graph::*;
pub use region::*;
