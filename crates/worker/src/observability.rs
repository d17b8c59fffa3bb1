use std::sync::OnceLock;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const JOBS_PROCESSED_TOTAL: &str = "catalog_worker_jobs_processed_total";
const JOBS_PROCESSING_DURATION_MS: &str = "catalog_worker_job_processing_duration_ms";
const LOCK_CONTENTION_TOTAL: &str = "catalog_worker_lock_contention_total";
const HEARTBEAT_FAILURES_TOTAL: &str = "catalog_worker_heartbeat_failures_total";
const RUN_EXIT_TOTAL: &str = "catalog_worker_run_exit_total";
const JOBS_RECLAIMED_GAUGE: &str = "catalog_worker_jobs_reclaimed";
const QUEUE_READY_GAUGE: &str = "catalog_worker_queue_ready_total";
const QUEUE_LEASED_GAUGE: &str = "catalog_worker_queue_leased_total";
const QUEUE_DEADLETTER_GAUGE: &str = "catalog_worker_queue_deadletter_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Prometheus text for the current run; logged once the run ends since a
/// bounded worker exposes no scrape endpoint.
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_job_processed(job_type: &str, result: &str, duration_ms: f64) {
    counter!(
        JOBS_PROCESSED_TOTAL,
        "job_type" => job_type.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        JOBS_PROCESSING_DURATION_MS,
        "job_type" => job_type.to_string()
    )
    .record(duration_ms.max(0.0));
}

pub fn register_lock_contention(job_type: &str) {
    counter!(LOCK_CONTENTION_TOTAL, "job_type" => job_type.to_string()).increment(1);
}

pub fn register_heartbeat_failures(kind: &str, failures: u64) {
    if failures == 0 {
        return;
    }
    counter!(HEARTBEAT_FAILURES_TOTAL, "kind" => kind.to_string()).increment(failures);
}

pub fn register_run_exit(exit_reason: &str) {
    counter!(RUN_EXIT_TOTAL, "exit_reason" => exit_reason.to_string()).increment(1);
}

pub fn set_jobs_reclaimed(reclaimed: usize) {
    gauge!(JOBS_RECLAIMED_GAUGE).set(reclaimed as f64);
}

pub fn set_queue_depth_gauge(ready: u64, leased: u64, deadletter: u64) {
    gauge!(QUEUE_READY_GAUGE).set(ready as f64);
    gauge!(QUEUE_LEASED_GAUGE).set(leased as f64);
    gauge!(QUEUE_DEADLETTER_GAUGE).set(deadletter as f64);
}
