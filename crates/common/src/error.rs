use thiserror::Error;

/// Canonical flowsched error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SchedError::NotFound`]: lookups for ids that were never registered
/// - [`SchedError::IllegalState`]: event-sequencing contract violations inside the coordinator
/// - [`SchedError::InvalidBounds`]: parallelism bounds that can never be satisfied
/// - [`SchedError::InvalidGraph`]: structurally broken job graphs
/// - [`SchedError::InvalidConfig`]: configuration/environment contract violations
/// - [`SchedError::Io`] / [`SchedError::Serde`]: raw loading failures at the edges
#[derive(Debug, Error)]
pub enum SchedError {
    /// Lookup for an unregistered vertex, region or job.
    ///
    /// Recoverable by the caller, e.g. "parallelism not decided yet".
    #[error("not found: {0}")]
    NotFound(String),

    /// Programming-contract failure in event sequencing.
    ///
    /// Examples:
    /// - registering parallelism info twice for the same vertex
    /// - scheduling a region that was already scheduled
    /// - a finish event for a vertex that already finished
    ///
    /// These fail fast and are never retried.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Parallelism bounds rejected at graph-build time (`min > max`, `min == 0`).
    #[error("invalid parallelism bounds: {0}")]
    InvalidBounds(String),

    /// Structurally invalid job graph.
    ///
    /// Examples:
    /// - edge endpoint referencing an unknown vertex
    /// - duplicate vertex ids
    /// - cycles
    #[error("invalid job graph: {0}")]
    InvalidGraph(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Decode/encode failures of external payloads (job graphs, event logs).
    #[error("serialization error: {0}")]
    Serde(String),
}

impl SchedError {
    /// True for coordinator invariant violations that must fail the job fast.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }
}

/// Standard flowsched result alias.
pub type Result<T> = std::result::Result<T, SchedError>;
