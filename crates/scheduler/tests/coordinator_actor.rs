use std::sync::Arc;

use flowsched_common::{JobId, RegionId, SchedError, SchedulerConfig, VertexId};
use flowsched_graph::{ExecutionMode, JobGraph, JobGraphBuilder};
use flowsched_scheduler::{
    ChannelDeploymentSink, JobCoordinator, JobState, ParallelismInfo, RegionState,
    SchedulingEvent,
};

fn pipeline() -> (JobGraph, VertexId, VertexId, VertexId) {
    let mut b = JobGraphBuilder::new(ExecutionMode::Batch);
    let scan = b.fixed_vertex("scan", 2);
    let shuffle = b.adaptive_vertex("shuffle", 1, Some(8));
    let sink = b.adaptive_vertex("sink", 1, Some(8));
    b.blocking(scan, shuffle).blocking(shuffle, sink);
    (b.build().expect("graph"), scan, shuffle, sink)
}

fn finished(vertex: VertexId, bytes: Vec<Vec<u64>>) -> SchedulingEvent {
    SchedulingEvent::VertexFinished {
        vertex,
        subpartition_bytes: bytes,
    }
}

#[tokio::test]
async fn events_are_applied_in_arrival_order() {
    let (sink, mut deployed) = ChannelDeploymentSink::channel();
    let handle = JobCoordinator::new(SchedulerConfig {
        target_bytes_per_instance: 64,
        ..SchedulerConfig::default()
    })
    .spawn(Arc::new(sink));

    let (graph, scan, shuffle, sink_vertex) = pipeline();
    handle.submit_job(JobId(1), graph).await.expect("submit");
    handle
        .send_event(JobId(1), finished(scan, vec![vec![32, 32, 32, 32]]))
        .await
        .expect("scan");
    handle
        .send_event(JobId(1), finished(shuffle, vec![vec![10], vec![10]]))
        .await
        .expect("shuffle");

    let mut order = Vec::new();
    for _ in 0..3 {
        let (_, batch) = deployed.recv().await.expect("batch");
        order.extend(batch.into_iter().map(|r| r.region_id.0));
    }
    assert_eq!(order, vec![0, 1, 2]);

    let reader = handle.parallelism_reader(JobId(1)).await.expect("reader");
    let snapshot = reader.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot[1].1.parallelism(), Some(2));
    let info: ParallelismInfo = reader.get_parallelism_info(sink_vertex).expect("info");
    assert_eq!(info.parallelism(), Some(1));
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn invariant_violation_fails_only_the_offending_job() {
    let (sink, _deployed) = ChannelDeploymentSink::channel();
    let handle = JobCoordinator::new(SchedulerConfig::default()).spawn(Arc::new(sink));

    let (g1, scan1, _, _) = pipeline();
    let (g2, scan2, _, _) = pipeline();
    handle.submit_job(JobId(1), g1).await.expect("submit 1");
    handle.submit_job(JobId(2), g2).await.expect("submit 2");

    handle
        .send_event(JobId(1), finished(scan1, vec![vec![1]]))
        .await
        .expect("first");
    handle
        .send_event(JobId(1), finished(scan1, vec![vec![1]]))
        .await
        .expect("duplicate is enqueued");
    handle
        .send_event(JobId(2), finished(scan2, vec![vec![1]]))
        .await
        .expect("other job");

    let failed = handle.job_status(JobId(1)).await.expect("status 1");
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.message.contains("duplicate finish"));
    assert!(failed.regions.iter().all(|r| r.state.is_terminal()));

    let healthy = handle.job_status(JobId(2)).await.expect("status 2");
    assert_eq!(healthy.state, JobState::Running);
    assert_eq!(healthy.region_state(RegionId(1)), Some(RegionState::Scheduled));

    assert!(matches!(
        handle.job_status(JobId(3)).await,
        Err(SchedError::NotFound(_))
    ));
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancel_through_the_actor() {
    let (sink, _deployed) = ChannelDeploymentSink::channel();
    let handle = JobCoordinator::new(SchedulerConfig::default()).spawn(Arc::new(sink));
    let (graph, scan, _, _) = pipeline();
    handle.submit_job(JobId(4), graph).await.expect("submit");
    handle
        .send_event(JobId(4), SchedulingEvent::JobCanceled)
        .await
        .expect("cancel");
    handle
        .send_event(JobId(4), finished(scan, vec![vec![1]]))
        .await
        .expect("late event");

    let status = handle.job_status(JobId(4)).await.expect("status");
    assert_eq!(status.state, JobState::Canceled);
    assert_eq!(status.finished_regions, 0);
    handle.shutdown().await.expect("shutdown");
}
