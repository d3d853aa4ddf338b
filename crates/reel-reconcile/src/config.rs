//! Reconciliation configuration.

use std::time::Duration;

/// Poll cadence while a job is active.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A job not terminal after this long is failed with a timeout.
pub const DEFAULT_POLL_MAX_DURATION: Duration = Duration::from_secs(4 * 60 * 60);

/// Compare-and-set attempts before a write gives up.
pub const DEFAULT_PERSIST_MAX_ATTEMPTS: u32 = 5;

/// Path the provider calls back on.
pub const WEBHOOK_PATH: &str = "/api/webhooks/provider";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub poll_interval: Duration,
    /// Bound on a single provider query
    pub poll_request_timeout: Duration,
    pub poll_max_duration: Duration,
    pub persist_max_attempts: u32,
    /// Callback URL handed to the provider at submission
    pub webhook_url: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_request_timeout: Duration::from_secs(30),
            poll_max_duration: DEFAULT_POLL_MAX_DURATION,
            persist_max_attempts: DEFAULT_PERSIST_MAX_ATTEMPTS,
            webhook_url: None,
        }
    }
}

impl ReconcileConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
        };

        Self {
            poll_interval: secs("POLL_INTERVAL_SECS").unwrap_or(defaults.poll_interval),
            poll_request_timeout: secs("POLL_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.poll_request_timeout),
            poll_max_duration: secs("POLL_MAX_DURATION_SECS")
                .unwrap_or(defaults.poll_max_duration),
            persist_max_attempts: std::env::var("PERSIST_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.persist_max_attempts),
            webhook_url: std::env::var("PUBLIC_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|base| format!("{}{}", base.trim_end_matches('/'), WEBHOOK_PATH)),
        }
    }
}
