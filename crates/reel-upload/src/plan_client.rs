//! Client for the presigned multipart plan API.

use std::sync::Arc;
use std::time::Duration;

use reel_auth::{AuthGuard, GuardOptions};
use reel_models::{PartUploadPlan, PlanUploadRequest, PlanUploadResponse};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{UploadError, UploadResult};

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Requests write plans with the caller's bearer credential.
///
/// Every request runs through the [`AuthGuard`], so an expired token is
/// refreshed and the request retried once without the caller noticing.
pub struct PlanClient {
    http: Client,
    plan_url: String,
    guard: Arc<AuthGuard>,
}

impl PlanClient {
    pub fn new(
        plan_url: impl Into<String>,
        guard: Arc<AuthGuard>,
        timeout: Duration,
    ) -> UploadResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            plan_url: plan_url.into(),
            guard,
        })
    }

    pub fn plan_url(&self) -> &str {
        &self.plan_url
    }

    pub async fn request_plan(&self, request: &PlanUploadRequest) -> UploadResult<PartUploadPlan> {
        self.guard
            .with_valid_credential(GuardOptions::default(), |token| {
                let http = self.http.clone();
                let url = self.plan_url.clone();
                let body = request.clone();
                async move {
                    let response = http.post(&url).bearer_auth(token).json(&body).send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        let message = serde_json::from_str::<ErrorEnvelope>(&text)
                            .ok()
                            .and_then(|e| e.error.or(e.message))
                            .unwrap_or(text);
                        return Err(UploadError::http(status.as_u16(), message));
                    }

                    let plan: PlanUploadResponse = response.json().await?;
                    debug!(
                        upload_id = %plan.upload_id,
                        total_parts = plan.total_parts,
                        "Received upload plan"
                    );
                    Ok(plan.into_plan())
                }
            })
            .await
    }
}
