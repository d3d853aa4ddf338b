//! Guard configuration.

use std::time::Duration;

/// Refresh when the credential is this close to expiry.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Background renewal cadence.
pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);

/// Authentication guard configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub refresh_buffer: Duration,
    pub renewal_interval: Duration,
    /// Where the user is sent after a forced sign-out
    pub login_url: Option<String>,
    /// Web API key for the secure-token endpoint
    pub firebase_api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
            login_url: None,
            firebase_api_key: None,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let refresh_buffer_secs: u64 = std::env::var("AUTH_REFRESH_BUFFER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REFRESH_BUFFER.as_secs());

        let renewal_secs: u64 = std::env::var("AUTH_RENEWAL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_RENEWAL_INTERVAL.as_secs());

        Self {
            refresh_buffer: Duration::from_secs(refresh_buffer_secs),
            renewal_interval: Duration::from_secs(renewal_secs),
            login_url: std::env::var("AUTH_LOGIN_URL").ok().filter(|s| !s.is_empty()),
            firebase_api_key: std::env::var("FIREBASE_API_KEY").ok().filter(|s| !s.is_empty()),
        }
    }
}
