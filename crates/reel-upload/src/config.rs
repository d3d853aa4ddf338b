//! Upload client configuration.

use std::time::Duration;

/// Backoff ladder applied per chunk: one attempt per entry, sleeping the
/// entry's delay before it.
pub const DEFAULT_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_millis(0),
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Resumable transfer endpoint (tus creation URL)
    pub endpoint: Option<String>,
    /// Presigned plan API (`POST /api/uploads/plan`)
    pub plan_url: Option<String>,
    pub retry_delays: Vec<Duration>,
    /// Bound on a single chunk request
    pub request_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            plan_url: None,
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl UploadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let non_empty = |name: &str| std::env::var(name).ok().filter(|s| !s.trim().is_empty());

        Self {
            endpoint: non_empty("UPLOAD_ENDPOINT"),
            plan_url: non_empty("UPLOAD_PLAN_URL"),
            retry_delays: non_empty("UPLOAD_RETRY_DELAYS_MS")
                .and_then(|s| parse_delays(&s))
                .unwrap_or(defaults.retry_delays),
            request_timeout: non_empty("UPLOAD_REQUEST_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

/// Parse a comma-separated list of millisecond delays. Any malformed entry
/// rejects the whole list.
pub fn parse_delays(raw: &str) -> Option<Vec<Duration>> {
    raw.split(',')
        .map(|part| part.trim().parse::<u64>().ok().map(Duration::from_millis))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_delays() {
        assert_eq!(
            parse_delays("0, 250,1000"),
            Some(vec![
                Duration::from_millis(0),
                Duration::from_millis(250),
                Duration::from_millis(1000)
            ])
        );
        assert_eq!(parse_delays("0,soon"), None);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::remove_var("UPLOAD_ENDPOINT");
        std::env::remove_var("UPLOAD_PLAN_URL");
        std::env::remove_var("UPLOAD_RETRY_DELAYS_MS");
        std::env::remove_var("UPLOAD_REQUEST_TIMEOUT_SECS");

        let config = UploadConfig::from_env();
        assert!(config.endpoint.is_none());
        assert_eq!(config.retry_delays, DEFAULT_RETRY_DELAYS.to_vec());
        assert_eq!(config.request_timeout, Duration::from_secs(120));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("UPLOAD_ENDPOINT", "https://tus.example.com/files/");
        std::env::set_var("UPLOAD_RETRY_DELAYS_MS", "10,20");

        let config = UploadConfig::from_env();
        assert_eq!(config.endpoint.as_deref(), Some("https://tus.example.com/files/"));
        assert_eq!(
            config.retry_delays,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );

        std::env::remove_var("UPLOAD_ENDPOINT");
        std::env::remove_var("UPLOAD_RETRY_DELAYS_MS");
    }
}
