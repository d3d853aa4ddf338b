//! Upload client metrics.

use metrics::{counter, gauge};

/// Metric name constants.
pub mod names {
    /// Bytes acknowledged by the remote endpoint.
    pub const BYTES_SENT_TOTAL: &str = "upload_bytes_sent_total";

    /// Chunk or create attempts that were retried.
    pub const RETRIES_TOTAL: &str = "upload_retries_total";

    /// Finished uploads by outcome (succeeded, failed, cancelled).
    pub const FINISHED_TOTAL: &str = "upload_finished_total";

    /// Uploads tracked by the worker.
    pub const ACTIVE: &str = "upload_active";
}

pub fn record_bytes_sent(bytes: u64) {
    counter!(names::BYTES_SENT_TOTAL).increment(bytes);
}

pub fn record_retry() {
    counter!(names::RETRIES_TOTAL).increment(1);
}

pub fn record_finished(outcome: &'static str) {
    counter!(names::FINISHED_TOTAL, "outcome" => outcome).increment(1);
}

pub fn set_active(count: usize) {
    gauge!(names::ACTIVE).set(count as f64);
}
