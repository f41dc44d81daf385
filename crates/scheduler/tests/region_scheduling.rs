use std::sync::Arc;

use flowsched_common::adaptive::SubpartitionRange;
use flowsched_common::{JobId, RegionId, SchedError, SchedulerConfig, VertexId};
use flowsched_graph::{ExecutionMode, JobGraph, JobGraphBuilder, ParallelismDecision};
use flowsched_scheduler::{
    DecisionReason, JobState, RegionState, SchedulingEvent, SchedulingStrategy, StrategyKind,
};

fn config(target_bytes: u64) -> SchedulerConfig {
    SchedulerConfig {
        target_bytes_per_instance: target_bytes,
        ..SchedulerConfig::default()
    }
}

fn strategy(graph: JobGraph, target_bytes: u64) -> SchedulingStrategy {
    SchedulingStrategy::new(JobId(1), Arc::new(graph), &config(target_bytes)).expect("strategy")
}

fn finished(vertex: VertexId, bytes: &[&[u64]]) -> SchedulingEvent {
    SchedulingEvent::VertexFinished {
        vertex,
        subpartition_bytes: bytes.iter().map(|b| b.to_vec()).collect(),
    }
}

#[test]
fn blocking_consumer_waits_for_producer_and_decision() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let a = b.fixed_vertex("a", 2);
    let c = b.adaptive_vertex("b", 1, Some(8));
    b.blocking(a, c);
    let mut st = strategy(b.build().expect("graph"), 100);

    let initial = st.start().expect("start");
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].region_id, RegionId(0));
    assert_eq!(initial[0].parallelism_of(a), Some(2));
    assert!(matches!(
        st.store().get_parallelism_info(c),
        Err(SchedError::NotFound(_))
    ));

    let early = st.schedule_region(RegionId(1)).expect_err("producer running");
    assert!(early.is_illegal_state());
    assert_eq!(
        st.region_state(RegionId(1)).expect("state"),
        RegionState::Unscheduled
    );

    let ready = st
        .on_event(finished(a, &[&[30, 30], &[30, 30]]))
        .expect("finish a");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].region_id, RegionId(1));
    let decided = ready[0].parallelism_of(c).expect("decided");
    assert_eq!(
        st.store().get_parallelism_info(c).expect("info").decision,
        ParallelismDecision::Decided(decided)
    );

    let dup = st
        .on_event(finished(a, &[&[30, 30]]))
        .expect_err("duplicate finish");
    assert!(dup.is_illegal_state());
    assert!(dup.to_string().contains("duplicate finish for vertex"));
    let again = st.schedule_region(RegionId(1)).expect_err("rescheduled");
    assert!(again.is_illegal_state());
}

#[test]
fn end_to_end_decision_splits_units_under_target() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 2);
    let d = b.adaptive_vertex("downstream", 1, Some(4));
    b.blocking(s, d);
    let mut st = strategy(b.build().expect("graph"), 100);
    st.start().expect("start");

    let ready = st
        .on_event(finished(s, &[&[20, 20, 20, 20], &[20, 20, 20, 20]]))
        .expect("finish source");
    assert_eq!(ready[0].parallelism_of(d), Some(2));
    assert_eq!(
        ready[0].vertices[0].input_ranges,
        vec![SubpartitionRange::new(0, 2), SubpartitionRange::new(2, 4)]
    );

    let outcome = st.decision(d).expect("outcome");
    assert_eq!(outcome.reason, DecisionReason::Fitted);
    assert_eq!(outcome.total_bytes, 160);
    assert_eq!(outcome.max_range_bytes, 80);
    assert_eq!(
        st.parallelism_reader()
            .get_parallelism_info(d)
            .expect("info")
            .parallelism(),
        Some(2)
    );
}

#[test]
fn oversized_units_clamp_to_max_and_empty_input_takes_min() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 1);
    let big = b.adaptive_vertex("big", 1, Some(3));
    let quiet = b.adaptive_vertex("quiet", 2, Some(6));
    b.blocking(s, big).blocking(s, quiet);
    let mut st = strategy(b.build().expect("graph"), 10);
    st.start().expect("start");

    st.on_event(finished(s, &[&[500, 1, 1, 1]])).expect("finish");
    assert_eq!(
        st.decision(big).map(|o| (o.parallelism, o.reason)),
        Some((3, DecisionReason::ClampedToMax))
    );

    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 1);
    let quiet = b.adaptive_vertex("quiet", 2, Some(6));
    b.blocking(s, quiet);
    let mut st = strategy(b.build().expect("graph"), 10);
    st.start().expect("start");
    st.on_event(finished(s, &[&[0, 0, 0]])).expect("finish");
    assert_eq!(
        st.decision(quiet).map(|o| (o.parallelism, o.reason)),
        Some((2, DecisionReason::EmptyInput))
    );
}

#[test]
fn co_ready_regions_are_emitted_in_one_batch_by_region_id() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 2);
    let x = b.adaptive_vertex("x", 1, Some(8));
    let y = b.fixed_vertex("y", 3);
    b.blocking(s, x).blocking(s, y);
    let mut st = strategy(b.build().expect("graph"), 1_000);
    st.start().expect("start");

    let ready = st.on_event(finished(s, &[&[1, 2, 3]])).expect("finish");
    let ids = ready.iter().map(|r| r.region_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![RegionId(1), RegionId(2)]);
    assert_eq!(ready[1].parallelism_of(y), Some(3));
    assert!(ready[1].vertices[0].input_ranges.is_empty());
    assert_eq!(ready[0].parallelism_of(x), Some(1));
}

#[test]
fn join_waits_for_every_blocking_input_and_sums_statistics() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let left = b.fixed_vertex("left", 1);
    let right = b.fixed_vertex("right", 1);
    let join = b.adaptive_vertex("join", 1, Some(4));
    b.blocking(left, join).blocking(right, join);
    let mut st = strategy(b.build().expect("graph"), 50);

    let initial = st.start().expect("start");
    assert_eq!(initial.len(), 2);

    let none = st.on_event(finished(left, &[&[10, 10]])).expect("left");
    assert!(none.is_empty());
    assert!(st.has_statistics(left));
    assert!(st.store().get_parallelism_info(join).is_err());

    let ready = st.on_event(finished(right, &[&[30, 30]])).expect("right");
    assert_eq!(ready.len(), 1);
    let outcome = st.decision(join).expect("outcome");
    assert_eq!(outcome.total_bytes, 80);
    assert_eq!(outcome.parallelism, 2);

    assert!(!st.has_statistics(left));
    assert!(!st.has_statistics(right));
}

#[test]
fn statistics_without_undetermined_consumers_are_not_retained() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 2);
    let fixed = b.fixed_vertex("sink", 2);
    b.blocking(s, fixed);
    let mut st = strategy(b.build().expect("graph"), 100);
    st.start().expect("start");
    st.on_event(finished(s, &[&[5, 5], &[5, 5]])).expect("finish");
    assert!(!st.has_statistics(s));
}

#[test]
fn region_lifecycle_runs_to_job_finish() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("scan", 2);
    let m = b.adaptive_vertex("map", 1, Some(8));
    let agg = b.adaptive_vertex("agg", 1, Some(8));
    b.pipelined(s, m).blocking(m, agg);
    let mut st = strategy(b.build().expect("graph"), 1_000);
    let initial = st.start().expect("start");
    assert_eq!(initial[0].parallelism_of(m), Some(2));

    st.on_event(SchedulingEvent::VertexRunning { vertex: s })
        .expect("running");
    assert_eq!(
        st.region_state(RegionId(0)).expect("state"),
        RegionState::Running
    );
    let dup = st
        .on_event(SchedulingEvent::VertexRunning { vertex: s })
        .expect_err("duplicate running");
    assert!(dup.is_illegal_state());

    assert!(st.on_event(finished(s, &[])).expect("scan").is_empty());
    let ready = st.on_event(finished(m, &[&[4, 4]])).expect("map");
    assert_eq!(ready.len(), 1);
    assert_eq!(st.state(), JobState::Running);

    st.on_event(finished(agg, &[])).expect("agg");
    let status = st.status();
    assert_eq!(status.state, JobState::Finished);
    assert_eq!(status.finished_regions, 2);
    assert!(status.is_terminal());
}

#[test]
fn cancel_stops_scheduling_and_ignores_later_events() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 2);
    let d = b.adaptive_vertex("downstream", 1, Some(4));
    b.blocking(s, d);
    let mut st = strategy(b.build().expect("graph"), 100);
    st.start().expect("start");

    st.on_event(SchedulingEvent::JobCanceled).expect("cancel");
    let status = st.status();
    assert_eq!(status.state, JobState::Canceled);
    assert!(
        status
            .regions
            .iter()
            .all(|r| r.state == RegionState::Canceled)
    );

    let ignored = st.on_event(finished(s, &[&[40, 40]])).expect("ignored");
    assert!(ignored.is_empty());
    assert!(st.store().get_parallelism_info(d).is_err());
}

#[test]
fn failure_cancels_every_other_region() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let left = b.fixed_vertex("left", 1);
    let right = b.fixed_vertex("right", 1);
    let join = b.adaptive_vertex("join", 1, Some(4));
    b.blocking(left, join).blocking(right, join);
    let mut st = strategy(b.build().expect("graph"), 100);
    st.start().expect("start");
    st.on_event(finished(left, &[&[1]])).expect("left");

    st.on_event(SchedulingEvent::VertexFailed {
        vertex: right,
        reason: "executor lost".to_string(),
    })
    .expect("fail");
    let status = st.status();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.message.contains("executor lost"));
    assert_eq!(status.region_state(RegionId(0)), Some(RegionState::Finished));
    assert_eq!(status.region_state(RegionId(1)), Some(RegionState::Failed));
    assert_eq!(status.region_state(RegionId(2)), Some(RegionState::Canceled));
}

#[test]
fn streaming_jobs_emit_every_region_at_start() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Streaming);
    let s1 = b.fixed_vertex("source-a", 2);
    let m = b.adaptive_vertex("map", 1, Some(8));
    let s2 = b.fixed_vertex("source-b", 3);
    b.pipelined(s1, m);
    let mut st = strategy(b.build().expect("graph"), 100);
    assert_eq!(st.kind(), StrategyKind::AllAtOnce);

    let batch = st.start().expect("start");
    let ids = batch.iter().map(|r| r.region_id).collect::<Vec<_>>();
    assert_eq!(ids, vec![RegionId(0), RegionId(1)]);
    assert_eq!(batch[0].parallelism_of(m), Some(2));
    assert_eq!(batch[1].parallelism_of(s2), Some(3));

    assert!(st.on_event(finished(m, &[&[1]])).expect("map").is_empty());
}

#[test]
fn streaming_blocking_edge_is_rejected_even_with_fixed_consumer() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Streaming);
    let source = b.fixed_vertex("source", 2);
    let sink = b.fixed_vertex("sink", 3);
    b.blocking(source, sink);
    let graph = Arc::new(b.build().expect("graph"));
    let err = SchedulingStrategy::new(JobId(1), graph, &config(100)).expect_err("admission");
    assert!(matches!(err, SchedError::InvalidGraph(_)));
    assert!(err.to_string().contains("blocking edge"));
}

#[test]
fn blocking_edge_inside_merged_region_inherits_parallelism() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let a = b.fixed_vertex("a", 3);
    let mid = b.adaptive_vertex("mid", 1, Some(8));
    let c = b.adaptive_vertex("c", 1, Some(8));
    b.blocking(a, mid).blocking(mid, c).pipelined(a, c);
    let mut st = strategy(b.build().expect("graph"), 100);

    assert_eq!(st.region_graph().len(), 1);
    let region = st.region_graph().region(RegionId(0)).expect("region");
    assert_eq!(region.internal_blocking_edges.len(), 2);

    let batch = st.start().expect("start");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].parallelism_of(mid), Some(3));
    assert_eq!(batch[0].parallelism_of(c), Some(3));
    for v in [mid, c] {
        assert_eq!(
            st.decision(v).map(|d| d.reason),
            Some(DecisionReason::Inherited)
        );
    }
}

#[test]
fn rescale_after_decision_keeps_decided_parallelism() {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let s = b.fixed_vertex("source", 4);
    let mut st = strategy(b.build().expect("graph"), 100);
    st.start().expect("start");

    assert!(!st.can_rescale_max_parallelism(s, 2).expect("query"));
    let info = st.rescale_max_parallelism(s, 64).expect("rescale");
    assert_eq!(info.bounds.max(), 64);
    assert_eq!(info.parallelism(), Some(4));
}
