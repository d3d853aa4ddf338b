//! Inbound provider webhooks.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use hmac::{Hmac, Mac};
use reel_provider::WebhookPayload;
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::handlers::jobs::OutcomeResponse;
use crate::handlers::{ok, Envelope};
use crate::metrics;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Webhook reply: an applied outcome, or a bare acknowledgement for
/// non-terminal notices.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WebhookResponse {
    Applied(OutcomeResponse),
    Acknowledged { message: String },
}

/// Check `sha256=<hex>` against the HMAC-SHA256 of the raw body.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> ApiResult<()> {
    let signature = header
        .map(str::trim)
        .and_then(|h| h.strip_prefix("sha256="))
        .ok_or_else(|| ApiError::unauthorized("Missing webhook signature"))?;
    let expected = hex::decode(signature)
        .map_err(|_| ApiError::unauthorized("Malformed webhook signature"))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::internal(format!("Webhook key rejected: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::unauthorized("Invalid webhook signature"))
}

/// Hex signature header value for `body`, as the provider sends it.
pub fn sign(secret: &str, body: &[u8]) -> ApiResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::internal(format!("Webhook key rejected: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// `POST /api/webhooks/provider`
///
/// Unmatched provider jobs are 404 and leave every record untouched.
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Envelope<WebhookResponse>>> {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if let Err(e) = verify_signature(secret, &body, header) {
            warn!("Rejected provider webhook: {}", e);
            metrics::record_webhook("rejected");
            return Err(e);
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        metrics::record_webhook("malformed");
        ApiError::bad_request(format!("Invalid webhook payload: {}", e))
    })?;

    let outcome = match state.jobs.handle_webhook(&payload).await {
        Ok(outcome) => outcome,
        Err(e) => {
            metrics::record_webhook(if e.is_not_found() { "unmatched" } else { "failed" });
            return Err(e.into());
        }
    };

    let response = match outcome {
        Some(outcome) => {
            metrics::record_webhook(outcome.disposition.as_str());
            info!(
                provider_job_id = %payload.project_id,
                session_id = %outcome.session_id,
                disposition = outcome.disposition.as_str(),
                clips_added = outcome.clips_added,
                "Provider webhook processed"
            );
            WebhookResponse::Applied(OutcomeResponse::new("Webhook processed", outcome))
        }
        None => {
            metrics::record_webhook("acknowledged");
            WebhookResponse::Acknowledged {
                message: "Webhook acknowledged".to_string(),
            }
        }
    };

    Ok(ok(response))
}
