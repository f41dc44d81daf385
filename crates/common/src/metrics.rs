use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    parallelism_decisions: CounterVec,
    decided_parallelism: HistogramVec,
    decision_input_bytes: CounterVec,
    regions_scheduled: CounterVec,
    region_states: GaugeVec,
    scheduling_events: CounterVec,
    invariant_violations: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_parallelism_decision(
        &self,
        job_id: &str,
        reason: &str,
        parallelism: u32,
        input_bytes: u64,
    ) {
        self.inner
            .parallelism_decisions
            .with_label_values(&[job_id, reason])
            .inc();
        self.inner
            .decided_parallelism
            .with_label_values(&[job_id])
            .observe(parallelism as f64);
        self.inner
            .decision_input_bytes
            .with_label_values(&[job_id])
            .inc_by(input_bytes as f64);
    }

    pub fn inc_regions_scheduled(&self, job_id: &str, regions: u64) {
        self.inner
            .regions_scheduled
            .with_label_values(&[job_id])
            .inc_by(regions as f64);
    }

    pub fn set_region_state_count(&self, job_id: &str, state: &str, regions: u64) {
        self.inner
            .region_states
            .with_label_values(&[job_id, state])
            .set(regions as f64);
    }

    pub fn inc_scheduling_events(&self, job_id: &str, kind: &str) {
        self.inner
            .scheduling_events
            .with_label_values(&[job_id, kind])
            .inc();
    }

    pub fn inc_invariant_violations(&self, job_id: &str) {
        self.inner
            .invariant_violations
            .with_label_values(&[job_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let parallelism_decisions = counter_vec(
            &registry,
            "flowsched_parallelism_decisions_total",
            "Parallelism decisions made, by reason",
            &["job_id", "reason"],
        );
        let decided_parallelism = histogram_vec(
            &registry,
            "flowsched_decided_parallelism",
            "Decided stage parallelism",
            &["job_id"],
            vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 512.0, 2048.0, 32768.0],
        );
        let decision_input_bytes = counter_vec(
            &registry,
            "flowsched_decision_input_bytes_total",
            "Upstream bytes considered by parallelism decisions",
            &["job_id"],
        );

        let regions_scheduled = counter_vec(
            &registry,
            "flowsched_regions_scheduled_total",
            "Regions emitted for deployment",
            &["job_id"],
        );
        let region_states = gauge_vec(
            &registry,
            "flowsched_region_states",
            "Regions per lifecycle state",
            &["job_id", "state"],
        );
        let scheduling_events = counter_vec(
            &registry,
            "flowsched_scheduling_events_total",
            "Scheduling events processed, by kind",
            &["job_id", "kind"],
        );
        let invariant_violations = counter_vec(
            &registry,
            "flowsched_invariant_violations_total",
            "Illegal-state violations that failed a job",
            &["job_id"],
        );

        Self {
            registry,
            parallelism_decisions,
            decided_parallelism,
            decision_input_bytes,
            regions_scheduled,
            region_states,
            scheduling_events,
            invariant_violations,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
