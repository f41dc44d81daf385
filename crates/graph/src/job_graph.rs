use std::collections::{HashSet, VecDeque};
use std::fmt;

use flowsched_common::config::DEFAULT_MAX_PARALLELISM;
use flowsched_common::{Result, SchedError, SchedulerConfig, VertexId};
use serde::{Deserialize, Serialize};

/// Data-exchange semantics of one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Producer and consumer run concurrently, streaming records directly.
    Pipelined,
    /// Consumer starts only after the producer's region fully finished.
    Blocking,
}

impl EdgeKind {
    pub fn is_blocking(self) -> bool {
        self == Self::Blocking
    }
}

/// How the job executes; selects the scheduling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Bounded inputs, regions activated as their blocking inputs finish.
    #[default]
    Batch,
    /// Unbounded inputs, every region deployed at once.
    Streaming,
}

/// Inclusive `[min, max]` parallelism range for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBounds", into = "RawBounds")]
pub struct ParallelismBounds {
    min: u32,
    max: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawBounds {
    min: u32,
    max: u32,
}

impl ParallelismBounds {
    /// Validate `1 <= min <= max`.
    pub fn new(min: u32, max: u32) -> Result<Self> {
        if min == 0 {
            return Err(SchedError::InvalidBounds(format!(
                "min parallelism must be >= 1, got [{min}, {max}]"
            )));
        }
        if min > max {
            return Err(SchedError::InvalidBounds(format!(
                "min parallelism {min} exceeds max {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Bounds pinned to exactly `p`.
    pub fn fixed(p: u32) -> Result<Self> {
        Self::new(p, p)
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn contains(&self, p: u32) -> bool {
        (self.min..=self.max).contains(&p)
    }

    pub fn clamp(&self, p: u32) -> u32 {
        p.clamp(self.min, self.max)
    }

    /// Same min, new max. Validated like [`ParallelismBounds::new`].
    pub fn with_max(&self, max: u32) -> Result<Self> {
        Self::new(self.min, max)
    }
}

impl TryFrom<RawBounds> for ParallelismBounds {
    type Error = SchedError;

    fn try_from(raw: RawBounds) -> Result<Self> {
        Self::new(raw.min, raw.max)
    }
}

impl From<ParallelismBounds> for RawBounds {
    fn from(b: ParallelismBounds) -> Self {
        Self {
            min: b.min,
            max: b.max,
        }
    }
}

impl fmt::Display for ParallelismBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Concrete instance count of a stage, or not decided yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismDecision {
    #[default]
    Undetermined,
    Decided(u32),
}

impl ParallelismDecision {
    pub fn decided(self) -> Option<u32> {
        match self {
            Self::Decided(p) => Some(p),
            Self::Undetermined => None,
        }
    }

    pub fn is_decided(self) -> bool {
        matches!(self, Self::Decided(_))
    }
}

/// One computation stage of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVertex {
    pub id: VertexId,
    pub name: String,
    pub bounds: ParallelismBounds,
    #[serde(default)]
    pub decision: ParallelismDecision,
}

/// Producer -> consumer data dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobEdge {
    pub producer: VertexId,
    pub consumer: VertexId,
    pub kind: EdgeKind,
}

/// Validated, immutable job graph.
///
/// Vertices live in an arena indexed by [`VertexId`]; adjacency is kept as
/// per-vertex lists of edge indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJobGraph", into = "RawJobGraph")]
pub struct JobGraph {
    mode: ExecutionMode,
    vertices: Vec<JobVertex>,
    edges: Vec<JobEdge>,
    inputs: Vec<Vec<usize>>,
    outputs: Vec<Vec<usize>>,
    topo_order: Vec<VertexId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawJobGraph {
    #[serde(default)]
    mode: ExecutionMode,
    vertices: Vec<JobVertex>,
    #[serde(default)]
    edges: Vec<JobEdge>,
}

impl TryFrom<RawJobGraph> for JobGraph {
    type Error = SchedError;

    fn try_from(raw: RawJobGraph) -> Result<Self> {
        Self::from_parts(raw.mode, raw.vertices, raw.edges)
    }
}

impl From<JobGraph> for RawJobGraph {
    fn from(g: JobGraph) -> Self {
        Self {
            mode: g.mode,
            vertices: g.vertices,
            edges: g.edges,
        }
    }
}

impl JobGraph {
    /// Validate and index a graph.
    ///
    /// Vertex ids must be dense and in arena order (`vertices[i].id == i`).
    /// Rejects dangling or duplicate edges, self loops, cycles, and decisions
    /// outside their vertex bounds.
    pub fn from_parts(
        mode: ExecutionMode,
        vertices: Vec<JobVertex>,
        edges: Vec<JobEdge>,
    ) -> Result<Self> {
        if vertices.is_empty() {
            return Err(SchedError::InvalidGraph("job graph has no vertices".to_string()));
        }
        for (idx, v) in vertices.iter().enumerate() {
            if v.id.index() != idx {
                return Err(SchedError::InvalidGraph(format!(
                    "vertex '{}' has id {} at arena position {idx}",
                    v.name, v.id
                )));
            }
            if let ParallelismDecision::Decided(p) = v.decision {
                if !v.bounds.contains(p) {
                    return Err(SchedError::InvalidBounds(format!(
                        "vertex {} ('{}') decided parallelism {p} outside bounds {}",
                        v.id, v.name, v.bounds
                    )));
                }
            }
        }

        let n = vertices.len();
        let mut inputs = vec![Vec::new(); n];
        let mut outputs = vec![Vec::new(); n];
        let mut seen = HashSet::new();
        for (idx, e) in edges.iter().enumerate() {
            if e.producer.index() >= n || e.consumer.index() >= n {
                return Err(SchedError::InvalidGraph(format!(
                    "edge {} -> {} references unknown vertex",
                    e.producer, e.consumer
                )));
            }
            if e.producer == e.consumer {
                return Err(SchedError::InvalidGraph(format!(
                    "self loop on vertex {}",
                    e.producer
                )));
            }
            if !seen.insert((e.producer, e.consumer)) {
                return Err(SchedError::InvalidGraph(format!(
                    "duplicate edge {} -> {}",
                    e.producer, e.consumer
                )));
            }
            outputs[e.producer.index()].push(idx);
            inputs[e.consumer.index()].push(idx);
        }

        let topo_order = topological_order(n, &edges, &inputs, &outputs)?;
        Ok(Self {
            mode,
            vertices,
            edges,
            inputs,
            outputs,
            topo_order,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn vertices(&self) -> &[JobVertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[JobEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex(&self, id: VertexId) -> Result<&JobVertex> {
        self.vertices
            .get(id.index())
            .ok_or_else(|| SchedError::NotFound(format!("vertex {id}")))
    }

    /// Edges consumed by `id`, in declaration order.
    pub fn inputs(&self, id: VertexId) -> impl Iterator<Item = &JobEdge> {
        self.inputs
            .get(id.index())
            .into_iter()
            .flatten()
            .map(|idx| &self.edges[*idx])
    }

    /// Edges produced by `id`, in declaration order.
    pub fn outputs(&self, id: VertexId) -> impl Iterator<Item = &JobEdge> {
        self.outputs
            .get(id.index())
            .into_iter()
            .flatten()
            .map(|idx| &self.edges[*idx])
    }

    /// Vertices ordered so every producer precedes its consumers. Ties break by id.
    pub fn topological_order(&self) -> &[VertexId] {
        &self.topo_order
    }

    /// Vertices without inputs.
    pub fn sources(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices
            .iter()
            .map(|v| v.id)
            .filter(|id| self.inputs[id.index()].is_empty())
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| SchedError::Serde(format!("encode job graph failed: {e}")))
    }

    /// Decode and validate a JSON job graph.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SchedError::Serde(format!("invalid job graph json: {e}")))
    }
}

// Kahn's algorithm with a min-ordered ready queue so the order is stable.
fn topological_order(
    n: usize,
    edges: &[JobEdge],
    inputs: &[Vec<usize>],
    outputs: &[Vec<usize>],
) -> Result<Vec<VertexId>> {
    let mut indegree = inputs.iter().map(Vec::len).collect::<Vec<_>>();
    let mut ready = (0..n).filter(|i| indegree[*i] == 0).collect::<VecDeque<_>>();
    let mut order = Vec::with_capacity(n);
    while let Some(v) = ready.pop_front() {
        order.push(VertexId(v as u32));
        let mut unlocked = Vec::new();
        for idx in &outputs[v] {
            let c = edges[*idx].consumer.index();
            indegree[c] -= 1;
            if indegree[c] == 0 {
                unlocked.push(c);
            }
        }
        unlocked.sort_unstable();
        for c in unlocked {
            let pos = ready.partition_point(|x| *x < c);
            ready.insert(pos, c);
        }
    }
    if order.len() != n {
        let stuck = (0..n)
            .filter(|i| indegree[*i] > 0)
            .map(|i| VertexId(i as u32).to_string())
            .collect::<Vec<_>>();
        return Err(SchedError::InvalidGraph(format!(
            "cycle detected through vertices [{}]",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

#[derive(Debug, Clone)]
struct PendingVertex {
    name: String,
    min: u32,
    max: u32,
    decision: ParallelismDecision,
}

/// Incremental job-graph construction.
///
/// Bounds are validated in [`JobGraphBuilder::build`], so a bad stage aborts
/// admission before any scheduling starts.
#[derive(Debug, Clone)]
pub struct JobGraphBuilder {
    mode: ExecutionMode,
    default_max_parallelism: u32,
    vertices: Vec<PendingVertex>,
    edges: Vec<JobEdge>,
}

impl JobGraphBuilder {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            default_max_parallelism: DEFAULT_MAX_PARALLELISM,
            vertices: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Builder whose adaptive vertices default to `config.default_max_parallelism`.
    pub fn from_config(mode: ExecutionMode, config: &SchedulerConfig) -> Self {
        Self::new(mode).with_default_max_parallelism(config.default_max_parallelism)
    }

    /// Max parallelism used by [`JobGraphBuilder::adaptive_vertex`] when none is given.
    pub fn with_default_max_parallelism(mut self, max: u32) -> Self {
        self.default_max_parallelism = max;
        self
    }

    /// Add a vertex with explicit bounds and initial decision.
    pub fn vertex(
        &mut self,
        name: impl Into<String>,
        min: u32,
        max: u32,
        decision: ParallelismDecision,
    ) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(PendingVertex {
            name: name.into(),
            min,
            max,
            decision,
        });
        id
    }

    /// Vertex whose parallelism is fixed at submission.
    pub fn fixed_vertex(&mut self, name: impl Into<String>, parallelism: u32) -> VertexId {
        self.vertex(
            name,
            parallelism,
            parallelism,
            ParallelismDecision::Decided(parallelism),
        )
    }

    /// Vertex whose parallelism is decided at runtime within `[min, max]`.
    pub fn adaptive_vertex(
        &mut self,
        name: impl Into<String>,
        min: u32,
        max: Option<u32>,
    ) -> VertexId {
        let max = max.unwrap_or(self.default_max_parallelism);
        self.vertex(name, min, max, ParallelismDecision::Undetermined)
    }

    pub fn connect(&mut self, producer: VertexId, consumer: VertexId, kind: EdgeKind) -> &mut Self {
        self.edges.push(JobEdge {
            producer,
            consumer,
            kind,
        });
        self
    }

    pub fn pipelined(&mut self, producer: VertexId, consumer: VertexId) -> &mut Self {
        self.connect(producer, consumer, EdgeKind::Pipelined)
    }

    pub fn blocking(&mut self, producer: VertexId, consumer: VertexId) -> &mut Self {
        self.connect(producer, consumer, EdgeKind::Blocking)
    }

    pub fn build(&self) -> Result<JobGraph> {
        let mut vertices = Vec::with_capacity(self.vertices.len());
        for (idx, p) in self.vertices.iter().enumerate() {
            let bounds = ParallelismBounds::new(p.min, p.max).map_err(|e| match e {
                SchedError::InvalidBounds(msg) => {
                    SchedError::InvalidBounds(format!("vertex '{}': {msg}", p.name))
                }
                other => other,
            })?;
            vertices.push(JobVertex {
                id: VertexId(idx as u32),
                name: p.name.clone(),
                bounds,
                decision: p.decision,
            });
        }
        JobGraph::from_parts(self.mode, vertices, self.edges.clone())
    }
}
