//! Job submission, manual reconciliation and status reads.

use axum::extract::{Path, State};
use axum::Json;
use reel_models::{Clip, JobStatus, ProcessingJob, ProviderJobId, SessionId};
use reel_reconcile::{ApplyOutcome, SubmitJob};
use reel_storage::keys;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::handlers::{ok, ApiJson, Envelope};
use crate::metrics;
use crate::state::AppState;

const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_MAX_CLIPS: u32 = 10;

/// Request body of `POST /api/jobs`.
///
/// The source is either an uploaded object (`storageKey`, signed for read
/// here) or a URL the provider can fetch directly.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    #[serde(default)]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    #[validate(length(min = 2, max = 16))]
    pub language: Option<String>,
    #[serde(default)]
    pub preferred_durations: Vec<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 100))]
    pub max_clips: Option<u32>,
    #[serde(default)]
    #[validate(range(max = 100))]
    pub min_virality_score: Option<u8>,
    #[serde(default)]
    pub abandon_previous: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub message: String,
    pub job: ProcessingJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion_minutes: Option<u32>,
}

/// `POST /api/jobs`
pub async fn submit_job(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<SubmitJobRequest>,
) -> ApiResult<Json<Envelope<SubmitJobResponse>>> {
    request
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let source_url = resolve_source_url(&state, &user, &request).await?;

    let submit = SubmitJob {
        session_id: SessionId::from(request.session_id.trim()),
        owner_id: user.uid.clone(),
        source_url,
        language: request
            .language
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        preferred_durations: request.preferred_durations.clone(),
        max_clips: request.max_clips.unwrap_or(DEFAULT_MAX_CLIPS),
        min_virality_score: request.min_virality_score.unwrap_or(0),
        abandon_previous: request.abandon_previous,
    };

    let submitted = match state.jobs.submit_job(submit).await {
        Ok(submitted) => {
            metrics::record_job_submitted("accepted");
            submitted
        }
        Err(e) => {
            metrics::record_job_submitted("rejected");
            return Err(e.into());
        }
    };

    info!(
        session_id = %submitted.job.session_id,
        provider_job_id = %submitted.job.provider_job_id,
        uid = %user.uid,
        "Job submitted"
    );

    Ok(ok(SubmitJobResponse {
        message: "Job submitted".to_string(),
        job: submitted.job,
        estimated_completion_minutes: submitted.estimated_completion_minutes,
    }))
}

async fn resolve_source_url(
    state: &AppState,
    user: &AuthUser,
    request: &SubmitJobRequest,
) -> ApiResult<String> {
    let storage_key = request
        .storage_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());
    let source_url = request
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());

    match (storage_key, source_url) {
        (Some(key), _) => {
            if !keys::is_owned_by(key, &user.uid) {
                warn!(uid = %user.uid, "Job submitted for a foreign storage key");
                return Err(ApiError::not_found("Upload not found"));
            }
            Ok(state
                .planner
                .source_url(key, state.config.source_url_expiry)
                .await?)
        }
        (None, Some(raw)) => {
            let url = url::Url::parse(raw)
                .map_err(|e| ApiError::bad_request(format!("Invalid sourceUrl: {}", e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ApiError::bad_request("sourceUrl must be http(s)"));
            }
            Ok(url.to_string())
        }
        (None, None) => Err(ApiError::bad_request("storageKey or sourceUrl is required")),
    }
}

/// Request body of `POST /api/jobs/reconcile`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub provider_job_id: Option<String>,
}

/// What one observation did, as reported to callers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeResponse {
    pub message: String,
    pub session_id: SessionId,
    pub disposition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
    pub clips_added: usize,
    pub total_clips: usize,
}

impl OutcomeResponse {
    pub fn new(message: impl Into<String>, outcome: ApplyOutcome) -> Self {
        Self {
            message: message.into(),
            session_id: outcome.session_id,
            disposition: outcome.disposition.as_str().to_string(),
            job_status: outcome.job_status,
            clips_added: outcome.clips_added,
            total_clips: outcome.total_clips,
        }
    }
}

/// `POST /api/jobs/reconcile`
///
/// Operator recovery: binds the provider job to the caller's session and
/// re-queries it.
pub async fn reconcile_job(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(request): ApiJson<ReconcileRequest>,
) -> ApiResult<Json<Envelope<OutcomeResponse>>> {
    let session_id = required(request.session_id.as_deref(), "sessionId")?;
    let provider_job_id = required(request.provider_job_id.as_deref(), "providerJobId")?;

    let outcome = state
        .jobs
        .manual_reconcile(
            &SessionId::from(session_id),
            &ProviderJobId::from(provider_job_id),
            &user.uid,
        )
        .await?;

    Ok(ok(OutcomeResponse::new("Job reconciled", outcome)))
}

fn required<'a>(value: Option<&'a str>, field: &str) -> ApiResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("Missing required field(s): {}", field)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJobResponse {
    pub session_id: SessionId,
    pub job: Option<ProcessingJob>,
    pub clips: Vec<Clip>,
}

/// `GET /api/sessions/:session_id/job`
pub async fn get_session_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Envelope<SessionJobResponse>>> {
    let record = state
        .jobs
        .get_job(&SessionId::from(session_id), &user.uid)
        .await?;

    Ok(ok(SessionJobResponse {
        session_id: record.session_id,
        job: record.job,
        clips: record.clips,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_defaults_and_validation() {
        let request: SubmitJobRequest = serde_json::from_value(serde_json::json!({
            "sessionId": "s-1",
            "sourceUrl": "https://cdn.test/a.mp4"
        }))
        .unwrap();
        assert!(request.validate().is_ok());
        assert!(!request.abandon_previous);
        assert!(request.preferred_durations.is_empty());

        let request = SubmitJobRequest {
            session_id: "s-1".into(),
            max_clips: Some(0),
            ..SubmitJobRequest::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_required_trims_and_names_field() {
        assert_eq!(required(Some(" p-1 "), "providerJobId").unwrap(), "p-1");
        let err = required(Some("  "), "providerJobId").unwrap_err();
        assert!(err.to_string().contains("providerJobId"));
        assert!(required(None, "sessionId").is_err());
    }
}
