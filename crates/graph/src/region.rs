//! Pipelined-region partitioning.
//!
//! Stages joined by pipelined edges must run concurrently, so they form one
//! atomic scheduling unit. Partitioning works in three passes:
//! - union stages across every pipelined edge;
//! - merge groups that form a cycle through blocking edges (a group cannot
//!   both wait for and feed another group), turning those blocking edges into
//!   region-internal ones;
//! - order the resulting regions topologically and assign [`RegionId`]s in
//!   that order, breaking ties by the earliest member stage.
//!
//! The result is computed once per job and never recomputed.

use std::collections::BTreeSet;

use flowsched_common::{RegionId, Result, SchedError, VertexId};
use serde::Serialize;
use tracing::debug;

use crate::job_graph::{JobEdge, JobGraph};

/// One blocking dependency of a region on another region's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumedInput {
    pub producer_region: RegionId,
    pub edge: JobEdge,
}

/// Maximal group of stages connected by pipelined edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulingRegion {
    pub id: RegionId,
    /// Member stages in topological order.
    pub vertices: Vec<VertexId>,
    /// Cross-region inputs; always blocking.
    pub consumed_inputs: Vec<ConsumedInput>,
    /// Distinct regions this region waits on, ascending.
    pub producer_regions: Vec<RegionId>,
    /// Distinct regions waiting on this region, ascending.
    pub consumer_regions: Vec<RegionId>,
    /// Blocking edges absorbed into the region by cycle merging.
    pub internal_blocking_edges: Vec<JobEdge>,
}

impl SchedulingRegion {
    pub fn is_source(&self) -> bool {
        self.consumed_inputs.is_empty()
    }

    pub fn contains(&self, vertex: VertexId) -> bool {
        self.vertices.contains(&vertex)
    }
}

/// Static region DAG of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionGraph {
    regions: Vec<SchedulingRegion>,
    region_of: Vec<RegionId>,
}

impl RegionGraph {
    pub fn regions(&self) -> &[SchedulingRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region(&self, id: RegionId) -> Result<&SchedulingRegion> {
        self.regions
            .get(id.index())
            .ok_or_else(|| SchedError::NotFound(format!("region {id}")))
    }

    /// Region owning `vertex`.
    pub fn region_of(&self, vertex: VertexId) -> Result<RegionId> {
        self.region_of
            .get(vertex.index())
            .copied()
            .ok_or_else(|| SchedError::NotFound(format!("vertex {vertex}")))
    }

    /// Regions without blocking inputs, ascending.
    pub fn source_regions(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.regions.iter().filter(|r| r.is_source()).map(|r| r.id)
    }

    /// True when `edge` crosses a region boundary, i.e. the consumer waits for
    /// the producer region to finish.
    pub fn is_cross_region(&self, edge: &JobEdge) -> bool {
        self.region_of.get(edge.producer.index()) != self.region_of.get(edge.consumer.index())
    }
}

/// Groups job stages into scheduling regions.
#[derive(Debug, Default)]
pub struct RegionPartitioner;

impl RegionPartitioner {
    pub fn partition(&self, graph: &JobGraph) -> RegionGraph {
        let n = graph.len();
        let topo_pos = {
            let mut pos = vec![0_usize; n];
            for (i, v) in graph.topological_order().iter().enumerate() {
                pos[v.index()] = i;
            }
            pos
        };

        let mut uf = UnionFind::new(n);
        for e in graph.edges() {
            if !e.kind.is_blocking() {
                uf.union(e.producer.index(), e.consumer.index());
            }
        }

        // Dense group index per pipelined component.
        let mut group_of_root = vec![usize::MAX; n];
        let mut group_of = vec![0_usize; n];
        let mut groups = 0_usize;
        for v in 0..n {
            let root = uf.find(v);
            if group_of_root[root] == usize::MAX {
                group_of_root[root] = groups;
                groups += 1;
            }
            group_of[v] = group_of_root[root];
        }

        let mut adj = vec![Vec::new(); groups];
        for e in graph.edges() {
            let (p, c) = (group_of[e.producer.index()], group_of[e.consumer.index()]);
            if p != c {
                adj[p].push(c);
            }
        }
        let component = strongly_connected_components(groups, &adj);
        let components = component.iter().copied().max().map_or(0, |c| c + 1);

        // Region key: earliest topological position among members.
        let mut key = vec![usize::MAX; components];
        for v in 0..n {
            let c = component[group_of[v]];
            key[c] = key[c].min(topo_pos[v]);
        }
        let mut comp_adj = vec![BTreeSet::new(); components];
        let mut indegree = vec![0_usize; components];
        for e in graph.edges() {
            let p = component[group_of[e.producer.index()]];
            let c = component[group_of[e.consumer.index()]];
            if p != c && comp_adj[p].insert(c) {
                indegree[c] += 1;
            }
        }
        let mut ready = (0..components)
            .filter(|c| indegree[*c] == 0)
            .map(|c| (key[c], c))
            .collect::<BTreeSet<_>>();
        let mut region_of_component = vec![RegionId(0); components];
        let mut next = 0_u32;
        while let Some((_, c)) = ready.pop_first() {
            region_of_component[c] = RegionId(next);
            next += 1;
            for d in &comp_adj[c] {
                indegree[*d] -= 1;
                if indegree[*d] == 0 {
                    ready.insert((key[*d], *d));
                }
            }
        }

        let region_of = (0..n)
            .map(|v| region_of_component[component[group_of[v]]])
            .collect::<Vec<_>>();

        let mut regions = (0..components as u32)
            .map(|r| SchedulingRegion {
                id: RegionId(r),
                vertices: Vec::new(),
                consumed_inputs: Vec::new(),
                producer_regions: Vec::new(),
                consumer_regions: Vec::new(),
                internal_blocking_edges: Vec::new(),
            })
            .collect::<Vec<_>>();
        for v in graph.topological_order() {
            regions[region_of[v.index()].index()].vertices.push(*v);
        }
        for e in graph.edges() {
            let (p, c) = (region_of[e.producer.index()], region_of[e.consumer.index()]);
            if p == c {
                if e.kind.is_blocking() {
                    regions[c.index()].internal_blocking_edges.push(*e);
                }
                continue;
            }
            regions[c.index()].consumed_inputs.push(ConsumedInput {
                producer_region: p,
                edge: *e,
            });
            regions[c.index()].producer_regions.push(p);
            regions[p.index()].consumer_regions.push(c);
        }
        for r in &mut regions {
            r.producer_regions.sort_unstable();
            r.producer_regions.dedup();
            r.consumer_regions.sort_unstable();
            r.consumer_regions.dedup();
            if !r.internal_blocking_edges.is_empty() {
                debug!(
                    region_id = %r.id,
                    edges = r.internal_blocking_edges.len(),
                    operator = "RegionPartitioner",
                    "blocking edges merged into region to break a region cycle"
                );
            }
        }

        debug!(
            vertices = n,
            regions = regions.len(),
            operator = "RegionPartitioner",
            "job graph partitioned"
        );
        RegionGraph { regions, region_of }
    }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

// Kosaraju with explicit stacks; returns a component index per node.
fn strongly_connected_components(n: usize, adj: &[Vec<usize>]) -> Vec<usize> {
    let mut visited = vec![false; n];
    let mut finish_order = Vec::with_capacity(n);
    for s in 0..n {
        if visited[s] {
            continue;
        }
        visited[s] = true;
        let mut stack = vec![(s, 0_usize)];
        while let Some((v, i)) = stack.pop() {
            if let Some(&w) = adj[v].get(i) {
                stack.push((v, i + 1));
                if !visited[w] {
                    visited[w] = true;
                    stack.push((w, 0));
                }
            } else {
                finish_order.push(v);
            }
        }
    }

    let mut radj = vec![Vec::new(); n];
    for (v, outs) in adj.iter().enumerate() {
        for w in outs {
            radj[*w].push(v);
        }
    }
    let mut component = vec![usize::MAX; n];
    let mut next = 0_usize;
    for &s in finish_order.iter().rev() {
        if component[s] != usize::MAX {
            continue;
        }
        component[s] = next;
        let mut stack = vec![s];
        while let Some(v) = stack.pop() {
            for &w in &radj[v] {
                if component[w] == usize::MAX {
                    component[w] = next;
                    stack.push(w);
                }
            }
        }
        next += 1;
    }
    component
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_graph::{ExecutionMode, JobGraphBuilder};

    #[test]
    fn blocking_edge_separates_regions() {
        let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
        let a = b.fixed_vertex("a", 2);
        let c = b.adaptive_vertex("c", 1, Some(4));
        b.blocking(a, c);
        let g = b.build().expect("graph");
        let rg = RegionPartitioner.partition(&g);

        assert_eq!(rg.len(), 2);
        assert_eq!(rg.region_of(a).expect("a"), RegionId(0));
        assert_eq!(rg.region_of(c).expect("c"), RegionId(1));
        let consumer = rg.region(RegionId(1)).expect("r1");
        assert_eq!(consumer.producer_regions, vec![RegionId(0)]);
        assert_eq!(consumer.consumed_inputs.len(), 1);
        assert_eq!(
            rg.region(RegionId(0)).expect("r0").consumer_regions,
            vec![RegionId(1)]
        );
        assert_eq!(rg.source_regions().collect::<Vec<_>>(), vec![RegionId(0)]);
    }

    #[test]
    fn pipelined_edges_merge_stages() {
        let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
        let scan = b.fixed_vertex("scan", 4);
        let map = b.fixed_vertex("map", 4);
        let agg = b.adaptive_vertex("agg", 1, Some(16));
        let sink = b.adaptive_vertex("sink", 1, Some(16));
        b.pipelined(scan, map).blocking(map, agg).pipelined(agg, sink);
        let g = b.build().expect("graph");
        let rg = RegionPartitioner.partition(&g);

        assert_eq!(rg.len(), 2);
        assert_eq!(rg.regions()[0].vertices, vec![scan, map]);
        assert_eq!(rg.regions()[1].vertices, vec![agg, sink]);
        assert!(rg.regions()[1].internal_blocking_edges.is_empty());
    }

    #[test]
    fn region_cycles_are_merged() {
        // a -blocking-> b -blocking-> c, and a -pipelined-> c: {a, c} would
        // both feed and wait on {b}.
        let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
        let a = b.fixed_vertex("a", 1);
        let mid = b.fixed_vertex("b", 1);
        let c = b.fixed_vertex("c", 1);
        b.blocking(a, mid).blocking(mid, c).pipelined(a, c);
        let g = b.build().expect("graph");
        let rg = RegionPartitioner.partition(&g);

        assert_eq!(rg.len(), 1);
        let only = &rg.regions()[0];
        assert_eq!(only.vertices, vec![a, mid, c]);
        assert_eq!(only.internal_blocking_edges.len(), 2);
        assert!(only.is_source());
    }

    #[test]
    fn independent_chains_get_ids_in_topological_order() {
        let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
        let s1 = b.fixed_vertex("s1", 1);
        let s2 = b.fixed_vertex("s2", 1);
        let join = b.adaptive_vertex("join", 1, Some(8));
        b.blocking(s1, join).blocking(s2, join);
        let g = b.build().expect("graph");
        let rg = RegionPartitioner.partition(&g);

        assert_eq!(rg.len(), 3);
        assert_eq!(rg.region_of(s1).expect("s1"), RegionId(0));
        assert_eq!(rg.region_of(s2).expect("s2"), RegionId(1));
        let j = rg.region(rg.region_of(join).expect("join")).expect("region");
        assert_eq!(j.producer_regions, vec![RegionId(0), RegionId(1)]);
        assert!(g.edges().iter().all(|e| rg.is_cross_region(e)));
    }

    #[test]
    fn partitioning_is_stable() {
        let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
        let a = b.fixed_vertex("a", 1);
        let x = b.adaptive_vertex("x", 1, Some(4));
        let y = b.adaptive_vertex("y", 1, Some(4));
        let z = b.adaptive_vertex("z", 1, Some(4));
        b.blocking(a, x).blocking(a, y).pipelined(x, z).blocking(y, z);
        let g = b.build().expect("graph");

        let first = RegionPartitioner.partition(&g);
        let second = RegionPartitioner.partition(&g);
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
        b.fixed_vertex("a", 1);
        let rg = RegionPartitioner.partition(&b.build().expect("graph"));
        assert!(matches!(rg.region(RegionId(3)), Err(SchedError::NotFound(_))));
        assert!(matches!(rg.region_of(VertexId(9)), Err(SchedError::NotFound(_))));
    }
}
