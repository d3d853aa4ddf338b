//! API configuration.

use std::time::Duration;

/// Default lifetime of the signed read URL handed to the provider.
const DEFAULT_SOURCE_URL_EXPIRY: Duration = Duration::from_secs(4 * 3600);

/// Where session records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    /// In-process store for local runs without GCP credentials
    Memory,
}

impl StoreBackend {
    fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Firestore,
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Rate limit requests per second
    pub rate_limit_rps: u32,
    /// Rate limit burst
    pub rate_limit_burst: u32,
    /// Request timeout
    pub request_timeout: Duration,
    /// Max request body size
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
    /// HS256 secret for bearer tokens; Firebase ID tokens are verified when unset
    pub jwt_secret: Option<String>,
    pub jwt_audience: Option<String>,
    /// Firebase project whose ID tokens are accepted
    pub firebase_project_id: Option<String>,
    /// HMAC key for provider webhook signatures
    pub webhook_secret: Option<String>,
    pub source_url_expiry: Duration,
    pub store_backend: StoreBackend,
    pub metrics_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            rate_limit_rps: 10,
            rate_limit_burst: 20,
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            environment: "development".to_string(),
            jwt_secret: None,
            jwt_audience: None,
            firebase_project_id: None,
            webhook_secret: None,
            source_url_expiry: DEFAULT_SOURCE_URL_EXPIRY,
            store_backend: StoreBackend::Firestore,
            metrics_enabled: true,
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            rate_limit_rps: std::env::var("RATE_LIMIT_RPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_rps),
            rate_limit_burst: std::env::var("RATE_LIMIT_BURST")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rate_limit_burst),
            request_timeout: std::env::var("REQUEST_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_body_size: std::env::var("MAX_BODY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_size),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            jwt_secret: non_empty("AUTH_JWT_SECRET"),
            jwt_audience: non_empty("AUTH_JWT_AUDIENCE"),
            firebase_project_id: non_empty("FIREBASE_PROJECT_ID")
                .or_else(|| non_empty("GCP_PROJECT_ID")),
            webhook_secret: non_empty("WEBHOOK_SECRET"),
            source_url_expiry: std::env::var("SOURCE_URL_EXPIRY_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.source_url_expiry),
            store_backend: std::env::var("STORE_BACKEND")
                .map(|s| StoreBackend::parse(&s))
                .unwrap_or(defaults.store_backend),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.metrics_enabled),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "API_PORT",
        "CORS_ORIGINS",
        "AUTH_JWT_SECRET",
        "FIREBASE_PROJECT_ID",
        "GCP_PROJECT_ID",
        "WEBHOOK_SECRET",
        "STORE_BACKEND",
        "METRICS_ENABLED",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        let config = ApiConfig::from_env();
        assert_eq!(config.port, 8000);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert!(config.jwt_secret.is_none());
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.store_backend, StoreBackend::Firestore);
        assert!(config.metrics_enabled);
        assert!(!config.is_production());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear();
        std::env::set_var("API_PORT", "9100");
        std::env::set_var("CORS_ORIGINS", "https://a.test, https://b.test");
        std::env::set_var("GCP_PROJECT_ID", "reel-prod");
        std::env::set_var("WEBHOOK_SECRET", "  ");
        std::env::set_var("STORE_BACKEND", "Memory");
        std::env::set_var("METRICS_ENABLED", "false");

        let config = ApiConfig::from_env();
        assert_eq!(config.port, 9100);
        assert_eq!(config.cors_origins, vec!["https://a.test", "https://b.test"]);
        assert_eq!(config.firebase_project_id.as_deref(), Some("reel-prod"));
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(!config.metrics_enabled);
        clear();
    }
}
