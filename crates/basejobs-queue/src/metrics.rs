//! Job metrics, recorded through the `metrics` facade.
//!
//! The binaries install the Prometheus exporter; without one these calls
//! are no-ops.

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "basejobs_jobs_enqueued_total";
    pub const JOBS_REJECTED_TOTAL: &str = "basejobs_jobs_rejected_total";
    pub const JOBS_STARTED_TOTAL: &str = "basejobs_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "basejobs_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "basejobs_jobs_failed_total";
    pub const JOBS_STALLED_TOTAL: &str = "basejobs_jobs_stalled_total";
    pub const JOBS_ACTIVE: &str = "basejobs_jobs_active";
    pub const JOB_DURATION_SECONDS: &str = "basejobs_job_duration_seconds";
    pub const QUEUE_LENGTH: &str = "basejobs_queue_length";
}

/// Record job enqueued.
pub fn record_job_enqueued(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
}

/// Record an enqueue rejected before a job was created.
pub fn record_job_rejected(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::JOBS_REJECTED_TOTAL, &labels).increment(1);
}

/// Record a job claimed by a worker.
pub fn record_job_started(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_STARTED_TOTAL, &labels).increment(1);
    gauge!(names::JOBS_ACTIVE).increment(1.0);
}

/// Record job completed.
pub fn record_job_completed(job_type: &str, duration_secs: f64) {
    let labels = [("type", job_type.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record job failed.
pub fn record_job_failed(job_type: &str, category: &str) {
    let labels = [
        ("type", job_type.to_string()),
        ("category", category.to_string()),
    ];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

/// Record a job execution ending, whatever the outcome.
pub fn record_job_finished() {
    gauge!(names::JOBS_ACTIVE).decrement(1.0);
}

/// Record a stalled job reclaimed from a dead worker.
pub fn record_job_stalled() {
    counter!(names::JOBS_STALLED_TOTAL).increment(1);
}

/// Update queue length gauge.
pub fn set_queue_length(length: u64) {
    gauge!(names::QUEUE_LENGTH).set(length as f64);
}
