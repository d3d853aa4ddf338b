//! Reconciliation metrics.

use metrics::{counter, gauge};

/// Metric name constants.
pub mod names {
    /// Observations by channel (poll, webhook, manual) and outcome.
    pub const OBSERVATIONS_TOTAL: &str = "reconcile_observations_total";

    /// Clips newly written to session records.
    pub const CLIPS_PERSISTED_TOTAL: &str = "reconcile_clips_persisted_total";

    /// Observations that carried nothing new.
    pub const DUPLICATES_TOTAL: &str = "reconcile_duplicate_observations_total";

    /// Compare-and-set writes that lost a race and were retried.
    pub const CAS_CONFLICTS_TOTAL: &str = "reconcile_cas_conflicts_total";

    /// Jobs submitted to the provider.
    pub const JOBS_SUBMITTED_TOTAL: &str = "reconcile_jobs_submitted_total";

    /// Poll loops currently running.
    pub const ACTIVE_POLLERS: &str = "reconcile_active_pollers";
}

pub fn record_observation(channel: &'static str, outcome: &'static str) {
    counter!(names::OBSERVATIONS_TOTAL, "channel" => channel, "outcome" => outcome).increment(1);
    if outcome == "duplicate" {
        counter!(names::DUPLICATES_TOTAL, "channel" => channel).increment(1);
    }
}

pub fn record_clips_persisted(count: usize) {
    counter!(names::CLIPS_PERSISTED_TOTAL).increment(count as u64);
}

pub fn record_cas_conflict() {
    counter!(names::CAS_CONFLICTS_TOTAL).increment(1);
}

pub fn record_submission(outcome: &'static str) {
    counter!(names::JOBS_SUBMITTED_TOTAL, "outcome" => outcome).increment(1);
}

pub fn set_active_pollers(count: usize) {
    gauge!(names::ACTIVE_POLLERS).set(count as f64);
}
