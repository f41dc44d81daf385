//! Multi-job coordinator.
//!
//! [`JobCoordinator`] owns one [`SchedulingStrategy`] per submitted job and
//! routes events to it. Invariant violations fail the offending job fast: the
//! violation is logged at `error`, counted, the job is marked failed and its
//! later events are ignored. Nothing is retried.
//!
//! [`JobCoordinator::spawn`] runs the coordinator as a single tokio task fed by
//! a bounded command channel. Commands are applied strictly in arrival order;
//! decisions are handed to a [`DeploymentSink`] without awaiting deployment.

use std::collections::HashMap;
use std::sync::Arc;

use flowsched_common::metrics::global_metrics;
use flowsched_common::{JobId, Result, SchedError, SchedulerConfig, VertexId};
use flowsched_graph::JobGraph;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::{ScheduleRegion, SchedulingEvent};
use crate::store::{ParallelismInfo, ParallelismReader, RescalePolicy, VertexParallelismStore};
use crate::strategy::{JobStatus, SchedulingStrategy};

/// Receiver of scheduling decisions. Must not block.
pub trait DeploymentSink: Send + Sync {
    fn deploy(&self, job_id: JobId, batch: Vec<ScheduleRegion>);
}

/// Forwards decision batches into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDeploymentSink {
    tx: mpsc::UnboundedSender<(JobId, Vec<ScheduleRegion>)>,
}

impl ChannelDeploymentSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(JobId, Vec<ScheduleRegion>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeploymentSink for ChannelDeploymentSink {
    fn deploy(&self, job_id: JobId, batch: Vec<ScheduleRegion>) {
        if self.tx.send((job_id, batch)).is_err() {
            warn!(job_id = %job_id, "deployment receiver dropped; batch discarded");
        }
    }
}

#[derive(Debug, Default)]
pub struct JobCoordinator {
    config: SchedulerConfig,
    jobs: HashMap<JobId, SchedulingStrategy>,
}

impl JobCoordinator {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Admit and start a job; returns the initial decision batch.
    pub fn submit_job(&mut self, job_id: JobId, graph: JobGraph) -> Result<Vec<ScheduleRegion>> {
        let strategy = SchedulingStrategy::new(job_id, Arc::new(graph), &self.config)?;
        self.start_job(strategy)
    }

    /// Like [`Self::submit_job`] with a custom max-parallelism rescale rule.
    pub fn submit_job_with_policy(
        &mut self,
        job_id: JobId,
        graph: JobGraph,
        policy: Arc<dyn RescalePolicy>,
    ) -> Result<Vec<ScheduleRegion>> {
        let store = VertexParallelismStore::with_policy(policy);
        let strategy =
            SchedulingStrategy::with_store(job_id, Arc::new(graph), &self.config, store)?;
        self.start_job(strategy)
    }

    fn start_job(&mut self, mut strategy: SchedulingStrategy) -> Result<Vec<ScheduleRegion>> {
        let job_id = strategy.job_id();
        if self.jobs.contains_key(&job_id) {
            return Err(SchedError::IllegalState(format!(
                "job {job_id} already submitted"
            )));
        }
        let batch = strategy.start()?;
        info!(
            job_id = %job_id,
            initial_regions = batch.len(),
            operator = "JobCoordinator",
            "job submitted"
        );
        self.jobs.insert(job_id, strategy);
        Ok(batch)
    }

    /// Route one event; returns the regions that became ready.
    pub fn handle_event(
        &mut self,
        job_id: JobId,
        event: SchedulingEvent,
    ) -> Result<Vec<ScheduleRegion>> {
        let strategy = self.strategy_mut(job_id)?;
        match strategy.on_event(event) {
            Ok(batch) => Ok(batch),
            Err(e) if e.is_illegal_state() => {
                error!(
                    job_id = %job_id,
                    error = %e,
                    operator = "JobCoordinator",
                    "scheduling invariant violated; failing job"
                );
                global_metrics().inc_invariant_violations(&job_id.to_string());
                strategy.abort(&e.to_string());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(self.strategy(job_id)?.status())
    }

    pub fn parallelism_reader(&self, job_id: JobId) -> Result<ParallelismReader> {
        Ok(self.strategy(job_id)?.parallelism_reader())
    }

    pub fn rescale_max_parallelism(
        &mut self,
        job_id: JobId,
        vertex: VertexId,
        desired_max: u32,
    ) -> Result<ParallelismInfo> {
        self.strategy_mut(job_id)?
            .rescale_max_parallelism(vertex, desired_max)
    }

    /// Submitted jobs, ascending.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids = self.jobs.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn strategy(&self, job_id: JobId) -> Result<&SchedulingStrategy> {
        self.jobs
            .get(&job_id)
            .ok_or_else(|| SchedError::NotFound(format!("unknown job: {job_id}")))
    }

    fn strategy_mut(&mut self, job_id: JobId) -> Result<&mut SchedulingStrategy> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| SchedError::NotFound(format!("unknown job: {job_id}")))
    }

    /// Move the coordinator onto a tokio task. Must be called within a runtime.
    pub fn spawn(self, sink: Arc<dyn DeploymentSink>) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let task = tokio::spawn(self.run(rx, sink));
        CoordinatorHandle {
            tx,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, sink: Arc<dyn DeploymentSink>) {
        info!(operator = "JobCoordinator", "coordinator loop started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit {
                    job_id,
                    graph,
                    reply,
                } => {
                    let result = self.submit_job(job_id, *graph).map(|batch| {
                        if !batch.is_empty() {
                            sink.deploy(job_id, batch);
                        }
                    });
                    let _ = reply.send(result);
                }
                Command::Event { job_id, event } => match self.handle_event(job_id, event) {
                    Ok(batch) if !batch.is_empty() => sink.deploy(job_id, batch),
                    Ok(_) => {}
                    Err(e) if e.is_illegal_state() => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "event rejected"),
                },
                Command::Status { job_id, reply } => {
                    let _ = reply.send(self.job_status(job_id));
                }
                Command::Reader { job_id, reply } => {
                    let _ = reply.send(self.parallelism_reader(job_id));
                }
                Command::Shutdown { reply } => {
                    debug!("coordinator shutdown requested");
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!(jobs = self.jobs.len(), operator = "JobCoordinator", "coordinator loop stopped");
    }
}

enum Command {
    Submit {
        job_id: JobId,
        graph: Box<JobGraph>,
        reply: oneshot::Sender<Result<()>>,
    },
    Event {
        job_id: JobId,
        event: SchedulingEvent,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Result<JobStatus>>,
    },
    Reader {
        job_id: JobId,
        reply: oneshot::Sender<Result<ParallelismReader>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable client of a spawned [`JobCoordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    pub async fn submit_job(&self, job_id: JobId, graph: JobGraph) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            job_id,
            graph: Box::new(graph),
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Enqueue an event. Resolution happens on the coordinator task; failures
    /// surface through [`Self::job_status`].
    pub async fn send_event(&self, job_id: JobId, event: SchedulingEvent) -> Result<()> {
        self.send(Command::Event { job_id, event }).await
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { job_id, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn parallelism_reader(&self, job_id: JobId) -> Result<ParallelismReader> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reader { job_id, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Stop the loop after every previously enqueued command was applied.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| stopped())?;
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.await
                .map_err(|e| SchedError::IllegalState(format!("coordinator task panicked: {e}")))?;
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> SchedError {
    SchedError::IllegalState("coordinator stopped".to_string())
}
