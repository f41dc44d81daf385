//! Replays a job graph and an event log through the coordinator.
//!
//! Usage: `flowsched-coordinator <job-graph.json> [events.jsonl]`
//!
//! Every decision batch is printed as one JSON line on stdout, followed by the
//! final job status and the parallelism snapshot. Logs go to stderr.

use std::env;
use std::fs;
use std::sync::Arc;

use flowsched_common::config::env_or_default;
use flowsched_common::{JobId, SchedError, SchedulerConfig, global_metrics};
use flowsched_graph::JobGraph;
use flowsched_scheduler::{ChannelDeploymentSink, JobCoordinator, SchedulingEvent};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn parse_events(text: &str) -> Result<Vec<SchedulingEvent>, SchedError> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            serde_json::from_str(l).map_err(|e| SchedError::Serde(format!("bad event '{l}': {e}")))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env_or_default("FLOWSCHED_LOG", "info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let graph_path = args.next().ok_or_else(|| {
        SchedError::InvalidConfig(
            "usage: flowsched-coordinator <job-graph.json> [events.jsonl]".to_string(),
        )
    })?;
    let events = match args.next() {
        Some(path) => parse_events(&fs::read_to_string(path)?)?,
        None => Vec::new(),
    };
    let job_id = JobId(env_or_default("FLOWSCHED_JOB_ID", "1").parse::<u64>()?);
    let config = SchedulerConfig::from_env()?;
    let graph = JobGraph::from_json(&fs::read(&graph_path)?)?;

    let (sink, mut deployed) = ChannelDeploymentSink::channel();
    let handle = JobCoordinator::new(config).spawn(Arc::new(sink));
    handle.submit_job(job_id, graph).await?;
    for event in events {
        handle.send_event(job_id, event).await?;
    }
    let status = handle.job_status(job_id).await?;
    let reader = handle.parallelism_reader(job_id).await?;
    handle.shutdown().await?;

    while let Some((job, batch)) = deployed.recv().await {
        println!("{}", json!({ "job_id": job, "schedule": batch }));
    }
    let parallelism = reader
        .snapshot()
        .into_iter()
        .map(|(vertex, info)| json!({ "vertex": vertex, "info": info }))
        .collect::<Vec<_>>();
    println!("{}", json!({ "status": status, "parallelism": parallelism }));

    if env_or_default("FLOWSCHED_DUMP_METRICS", "0") == "1" {
        eprintln!("{}", global_metrics().render_prometheus());
    }
    Ok(())
}
