use axum::extract::State;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// GET /metrics: dispatcher counters and gauges in Prometheus text format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}

/// Install the global Prometheus recorder and register the dispatcher metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_gauge!("ocr_jobs_in_flight", "Jobs currently holding a worker slot");
    metrics::describe_gauge!("ocr_queue_depth", "Jobs accepted but not yet started");
    metrics::describe_counter!("ocr_jobs_submitted_total", "Jobs accepted by the dispatcher");
    metrics::describe_counter!(
        "ocr_jobs_rejected_total",
        "Jobs rejected because the queue was full"
    );
    metrics::describe_counter!("ocr_job_attempts_total", "Engine invocations, including retries");
    metrics::describe_histogram!(
        "ocr_job_duration_seconds",
        "Wall time from a job starting to its result being routed"
    );
    metrics::describe_counter!("ocr_jobs_succeeded_total", "Jobs that produced an output document");
    metrics::describe_counter!("ocr_jobs_failed_total", "Failed jobs, labelled by failure kind");

    Ok(handle)
}
