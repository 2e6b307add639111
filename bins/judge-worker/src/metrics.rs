// Prometheus metrics for the judge worker

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Once;

use judge_common::QueueStatus;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_CLAIMED: IntCounter = IntCounter::new(
        "judge_jobs_claimed_total",
        "Total number of jobs claimed from the queue"
    )
    .expect("metric can be created");

    // outcome: done | failed | interrupted
    pub static ref JOBS_FINISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("judge_jobs_finished_total", "Total number of jobs finished by a worker"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref JOB_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("judge_job_duration_seconds", "Wall time spent executing one job")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("metric can be created");

    pub static ref TASK_VERDICTS: IntCounterVec = IntCounterVec::new(
        Opts::new("judge_task_verdicts_total", "Task verdicts by phase"),
        &["phase", "verdict"]
    )
    .expect("metric can be created");

    pub static ref JOBS_RECLAIMED: IntCounterVec = IntCounterVec::new(
        Opts::new("judge_jobs_reclaimed_total", "Stale jobs returned to pending"),
        &["from"]
    )
    .expect("metric can be created");

    pub static ref RESULTS_DRAINED: IntCounter = IntCounter::new(
        "judge_results_drained_total",
        "Results handed to the request tables"
    )
    .expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("judge_queue_depth", "Jobs in the queue by status"),
        &["status"]
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Register every collector. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(JOBS_CLAIMED.clone()),
            Box::new(JOBS_FINISHED.clone()),
            Box::new(JOB_DURATION.clone()),
            Box::new(TASK_VERDICTS.clone()),
            Box::new(JOBS_RECLAIMED.clone()),
            Box::new(RESULTS_DRAINED.clone()),
            Box::new(QUEUE_DEPTH.clone()),
        ];
        for collector in collectors {
            REGISTRY.register(collector).expect("collector can be registered");
        }
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics are not valid UTF-8")
}

pub fn record_jobs_claimed(count: usize) {
    JOBS_CLAIMED.inc_by(count as u64);
}

pub fn record_job_finished(outcome: &str, seconds: f64) {
    JOBS_FINISHED.with_label_values(&[outcome]).inc();
    JOB_DURATION.observe(seconds);
}

pub fn record_task_verdict(phase: &str, verdict: &str) {
    TASK_VERDICTS.with_label_values(&[phase, verdict]).inc();
}

pub fn record_reclaimed(from: QueueStatus, count: usize) {
    JOBS_RECLAIMED.with_label_values(&[from.as_str()]).inc_by(count as u64);
}

pub fn record_drained(count: usize) {
    RESULTS_DRAINED.inc_by(count as u64);
}

pub fn set_queue_depth(counts: &[(QueueStatus, u64)]) {
    for (status, count) in counts {
        QUEUE_DEPTH.with_label_values(&[status.as_str()]).set(*count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        init_metrics();
        init_metrics();
        record_task_verdict("judge", "WA");
        set_queue_depth(&[(QueueStatus::Pending, 4)]);

        let text = render_metrics().unwrap();
        assert!(text.contains("judge_task_verdicts_total"));
        assert!(text.contains("judge_queue_depth{status=\"pending\"} 4"));
    }
}
