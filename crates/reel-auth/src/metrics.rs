//! Auth guard metrics.

use metrics::counter;

/// Metric name constants.
pub mod names {
    /// Credential refreshes by outcome (success, error, invalid).
    pub const REFRESHES_TOTAL: &str = "auth_refreshes_total";

    /// Guarded operations retried after an auth failure.
    pub const RETRIES_TOTAL: &str = "auth_retries_total";
}

pub fn record_refresh(outcome: &'static str) {
    counter!(names::REFRESHES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_retry() {
    counter!(names::RETRIES_TOTAL).increment(1);
}
