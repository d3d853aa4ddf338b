//! Clip provider HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reel_models::ProviderJobId;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::types::{ProviderStatus, QueryResponse, SubmitRequest, SubmitResponse, CODE_ERROR_FLOOR};

/// Header carrying the provider API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Configuration for the provider client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider API
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Max retries for idempotent calls
    pub max_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

impl ProviderConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("CLIP_PROVIDER_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            api_key: std::env::var("CLIP_PROVIDER_API_KEY").unwrap_or_default(),
            timeout: std::env::var("CLIP_PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: std::env::var("CLIP_PROVIDER_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        }
    }
}

/// The external clip-generation service.
#[async_trait]
pub trait ClipProvider: Send + Sync {
    /// Start a job. Not retried: a duplicate submission would start a second
    /// provider-side job.
    async fn submit(&self, request: &SubmitRequest) -> ProviderResult<SubmitResponse>;

    /// Observe the current state of a job.
    async fn query(&self, job_id: &ProviderJobId) -> ProviderResult<ProviderStatus>;
}

/// HTTP binding of [`ClipProvider`].
pub struct HttpClipProvider {
    http: Client,
    config: ProviderConfig,
}

impl HttpClipProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> ProviderResult<Self> {
        Self::new(ProviderConfig::from_env())
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.config.timeout.as_secs())
        } else {
            ProviderError::Network(e)
        }
    }

    async fn error_from_response(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::ServiceUnavailable(format!("{}: {}", status, body))
        } else {
            ProviderError::Rejected {
                status: status.as_u16(),
                message: body,
            }
        }
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> ProviderResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Provider request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ClipProvider for HttpClipProvider {
    async fn submit(&self, request: &SubmitRequest) -> ProviderResult<SubmitResponse> {
        let url = format!("{}/project/create", self.config.base_url);
        debug!("Submitting clip job to {}", url);

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: SubmitResponse = response.json().await?;
        if let Some(code) = body.code.filter(|c| *c >= CODE_ERROR_FLOOR) {
            return Err(ProviderError::Rejected {
                status: 200,
                message: body
                    .message
                    .unwrap_or_else(|| format!("provider error {}", code)),
            });
        }
        Ok(body)
    }

    async fn query(&self, job_id: &ProviderJobId) -> ProviderResult<ProviderStatus> {
        let url = format!(
            "{}/project/query/{}",
            self.config.base_url,
            urlencoding::encode(job_id.as_str())
        );

        self.with_retry(|| async {
            let response = self
                .http
                .get(&url)
                .header(API_KEY_HEADER, &self.config.api_key)
                .send()
                .await
                .map_err(|e| self.map_send_error(e))?;

            if !response.status().is_success() {
                return Err(Self::error_from_response(response).await);
            }

            let body: QueryResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            Ok(ProviderStatus::from(body))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpClipProvider {
        HttpClipProvider::new(ProviderConfig {
            base_url: server.uri(),
            api_key: "secret".into(),
            timeout: Duration::from_secs(2),
            max_retries: 1,
        })
        .unwrap()
    }

    fn submit_request() -> SubmitRequest {
        SubmitRequest {
            source_url: "https://r2/src.mp4".into(),
            language: "en".into(),
            preferred_durations: vec![30],
            max_clips: 5,
            min_virality_score: 0,
            webhook_url: Some("https://api/webhooks/provider".into()),
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_config_from_env() {
        std::env::set_var("CLIP_PROVIDER_BASE_URL", "https://provider.example/api/");
        std::env::set_var("CLIP_PROVIDER_TIMEOUT_SECS", "45");
        std::env::remove_var("CLIP_PROVIDER_RETRIES");
        let config = ProviderConfig::from_env();
        assert_eq!(config.base_url, "https://provider.example/api");
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.max_retries, 2);
        std::env::remove_var("CLIP_PROVIDER_BASE_URL");
        std::env::remove_var("CLIP_PROVIDER_TIMEOUT_SECS");
    }

    #[tokio::test]
    async fn test_query_sends_api_key_and_maps_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/project/query/p-1"))
            .and(header(API_KEY_HEADER, "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 2000,
                "videos": [{ "videoUrl": "https://cdn/a.mp4" }, { "videoUrl": "https://cdn/b.mp4" }]
            })))
            .mount(&server)
            .await;

        let status = provider(&server).query(&ProviderJobId::from("p-1")).await.unwrap();
        match status {
            ProviderStatus::Completed { clips } => assert_eq!(clips.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 1000 })))
            .mount(&server)
            .await;

        let status = provider(&server).query(&ProviderJobId::from("p-1")).await.unwrap();
        assert_eq!(status, ProviderStatus::Processing);
    }

    #[tokio::test]
    async fn test_query_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server).query(&ProviderJobId::from("p-1")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_submit_returns_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/project/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 2000,
                "projectId": 98765,
                "estimatedCompletionMinutes": 12
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server).submit(&submit_request()).await.unwrap();
        assert_eq!(response.provider_job_id, "98765");
        assert_eq!(response.estimated_completion_minutes, Some(12));
    }

    #[tokio::test]
    async fn test_submit_error_code_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 4002,
                "projectId": "x",
                "errMsg": "invalid video url"
            })))
            .mount(&server)
            .await;

        let err = provider(&server).submit(&submit_request()).await.unwrap_err();
        match err {
            ProviderError::Rejected { message, .. } => assert_eq!(message, "invalid video url"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
