//! Provider wire types.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Poll code: job still running.
pub const CODE_PROCESSING: i64 = 1000;
/// Poll code: job finished, results embedded.
pub const CODE_COMPLETED: i64 = 2000;
/// Poll codes at or above this are failures.
pub const CODE_ERROR_FLOOR: i64 = 4000;

/// One result item exactly as the provider sent it. Field names vary
/// between API versions, so items stay untyped until normalization.
pub type RawClip = Value;

/// Job submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Readable URL of the uploaded source video
    pub source_url: String,
    pub language: String,
    /// Preferred clip lengths in seconds
    pub preferred_durations: Vec<u32>,
    pub max_clips: u32,
    pub min_virality_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Job submission response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(alias = "projectId", deserialize_with = "string_or_number")]
    pub provider_job_id: String,
    #[serde(default)]
    pub estimated_completion_minutes: Option<u32>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default, alias = "errMsg")]
    pub message: Option<String>,
}

/// Poll response body. Results arrive as `videos` or `clips` and the
/// failure text as `message`, `errMsg` or `error`; when a body carries more
/// than one spelling the first listed wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawQueryResponse")]
pub struct QueryResponse {
    pub code: i64,
    pub videos: Option<Vec<RawClip>>,
    pub message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQueryResponse {
    code: i64,
    #[serde(default)]
    videos: Option<Vec<RawClip>>,
    #[serde(default)]
    clips: Option<Vec<RawClip>>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    err_msg: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<RawQueryResponse> for QueryResponse {
    fn from(raw: RawQueryResponse) -> Self {
        Self {
            code: raw.code,
            videos: raw.videos.or(raw.clips),
            message: raw.message.or(raw.err_msg).or(raw.error),
        }
    }
}

/// Provider-side job state as observed by one poll or webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderStatus {
    Processing,
    Completed { clips: Vec<RawClip> },
    Failed { message: String },
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderStatus::Processing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderStatus::Processing => "processing",
            ProviderStatus::Completed { .. } => "completed",
            ProviderStatus::Failed { .. } => "failed",
        }
    }
}

impl From<QueryResponse> for ProviderStatus {
    fn from(response: QueryResponse) -> Self {
        match response.code {
            CODE_COMPLETED => ProviderStatus::Completed {
                clips: response.videos.unwrap_or_default(),
            },
            code if code >= CODE_ERROR_FLOOR => ProviderStatus::Failed {
                message: response
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("provider error {}", code)),
            },
            // 1000 and any intermediate code: keep polling.
            _ => ProviderStatus::Processing,
        }
    }
}

/// Terminal status carried by a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Completed,
    Failed,
    #[serde(other)]
    Other,
}

/// Inbound webhook body. `clips` is preferred over `videos` when both are
/// present.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawWebhookPayload")]
pub struct WebhookPayload {
    pub project_id: String,
    pub status: WebhookStatus,
    pub clips: Option<Vec<RawClip>>,
    pub error: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWebhookPayload {
    #[serde(alias = "providerJobId", deserialize_with = "string_or_number")]
    project_id: String,
    status: WebhookStatus,
    #[serde(default)]
    clips: Option<Vec<RawClip>>,
    #[serde(default)]
    videos: Option<Vec<RawClip>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

impl From<RawWebhookPayload> for WebhookPayload {
    fn from(raw: RawWebhookPayload) -> Self {
        Self {
            project_id: raw.project_id,
            status: raw.status,
            clips: raw.clips.or(raw.videos),
            error: raw.error,
            metadata: raw.metadata,
        }
    }
}

impl WebhookPayload {
    /// Observation carried by the webhook, `None` for non-terminal notices.
    pub fn observation(&self) -> Option<ProviderStatus> {
        match self.status {
            WebhookStatus::Completed => Some(ProviderStatus::Completed {
                clips: self.clips.clone().unwrap_or_default(),
            }),
            WebhookStatus::Failed => Some(ProviderStatus::Failed {
                message: self
                    .error
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "provider reported failure".to_string()),
            }),
            WebhookStatus::Other => None,
        }
    }
}

/// Provider ids arrive as strings or integers depending on the endpoint.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_codes_map_to_status() {
        let processing: QueryResponse = serde_json::from_value(json!({ "code": 1000 })).unwrap();
        assert_eq!(ProviderStatus::from(processing), ProviderStatus::Processing);

        let done: QueryResponse = serde_json::from_value(json!({
            "code": 2000,
            "videos": [{ "videoUrl": "https://cdn/1.mp4" }]
        }))
        .unwrap();
        match ProviderStatus::from(done) {
            ProviderStatus::Completed { clips } => assert_eq!(clips.len(), 1),
            other => panic!("unexpected {:?}", other),
        }

        let failed: QueryResponse =
            serde_json::from_value(json!({ "code": 4008, "errMsg": "video too long" })).unwrap();
        assert_eq!(
            ProviderStatus::from(failed),
            ProviderStatus::Failed {
                message: "video too long".into()
            }
        );
    }

    #[test]
    fn test_clips_alias_is_accepted() {
        let done: QueryResponse =
            serde_json::from_value(json!({ "code": 2000, "clips": [{}, {}] })).unwrap();
        assert_eq!(done.videos.map(|v| v.len()), Some(2));
    }

    #[test]
    fn test_videos_win_over_clips_when_both_present() {
        let done: QueryResponse = serde_json::from_value(json!({
            "code": 2000,
            "videos": [{ "videoUrl": "https://cdn/1.mp4" }],
            "clips": [{}, {}, {}],
            "message": "ok",
            "errMsg": "ignored"
        }))
        .unwrap();
        assert_eq!(done.videos.as_ref().map(|v| v.len()), Some(1));
        assert_eq!(done.message.as_deref(), Some("ok"));
    }

    #[test]
    fn test_webhook_with_clips_and_videos() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "projectId": "p-1",
            "status": "completed",
            "clips": [{ "id": "a" }],
            "videos": [{ "id": "b" }, { "id": "c" }]
        }))
        .unwrap();
        assert_eq!(payload.clips.map(|c| c.len()), Some(1));
    }

    #[test]
    fn test_failure_without_message() {
        let failed: QueryResponse = serde_json::from_value(json!({ "code": 4000 })).unwrap();
        assert_eq!(
            ProviderStatus::from(failed),
            ProviderStatus::Failed {
                message: "provider error 4000".into()
            }
        );
    }

    #[test]
    fn test_webhook_payload_numeric_project_id() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "projectId": 123456,
            "status": "completed",
            "clips": [{ "id": "a" }]
        }))
        .unwrap();
        assert_eq!(payload.project_id, "123456");
        assert!(matches!(
            payload.observation(),
            Some(ProviderStatus::Completed { ref clips }) if clips.len() == 1
        ));
    }

    #[test]
    fn test_webhook_failed_and_unknown_status() {
        let failed: WebhookPayload = serde_json::from_value(json!({
            "projectId": "p-1",
            "status": "failed",
            "error": "unsupported codec"
        }))
        .unwrap();
        assert_eq!(
            failed.observation(),
            Some(ProviderStatus::Failed {
                message: "unsupported codec".into()
            })
        );

        let progress: WebhookPayload =
            serde_json::from_value(json!({ "projectId": "p-1", "status": "processing" })).unwrap();
        assert!(progress.observation().is_none());
    }

    #[test]
    fn test_submit_request_wire_shape() {
        let req = SubmitRequest {
            source_url: "https://r2/src.mp4".into(),
            language: "en".into(),
            preferred_durations: vec![30, 60],
            max_clips: 10,
            min_virality_score: 60,
            webhook_url: None,
        };
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["sourceUrl"], "https://r2/src.mp4");
        assert_eq!(wire["preferredDurations"], json!([30, 60]));
        assert!(wire.get("webhookUrl").is_none());
    }
}
