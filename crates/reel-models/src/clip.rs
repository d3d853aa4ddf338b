//! Generated clip model.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Every generated clip is vertical.
pub const CLIP_ASPECT_RATIO: &str = "9:16";

/// Every generated clip is rendered at this quality.
pub const CLIP_QUALITY: &str = "1080p";

/// Status of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    /// Provider is still rendering the clip
    Processing,
    /// Clip is available for playback
    #[default]
    Ready,
    /// Clip was published by the user
    Published,
    /// Clip rendering failed
    Failed,
}

impl ClipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipStatus::Processing => "processing",
            ClipStatus::Ready => "ready",
            ClipStatus::Published => "published",
            ClipStatus::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ClipStatus::Processing),
            "ready" | "completed" => Some(ClipStatus::Ready),
            "published" => Some(ClipStatus::Published),
            "failed" => Some(ClipStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A short vertical clip produced by the provider for a content session.
///
/// `virality_score` is always on the 0-100 scale regardless of the scale the
/// provider reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    pub title: String,
    pub duration_seconds: f64,
    pub aspect_ratio: String,
    pub quality: String,
    pub video_url: String,
    #[serde(default)]
    pub thumbnail_url: String,
    pub virality_score: u8,
    #[serde(default)]
    pub virality_reasoning: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub suggested_caption: String,
    #[serde(default)]
    pub suggested_hashtags: Vec<String>,
    #[serde(default)]
    pub status: ClipStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_status_parse_accepts_provider_alias() {
        assert_eq!(ClipStatus::parse("completed"), Some(ClipStatus::Ready));
        assert_eq!(ClipStatus::parse("published"), Some(ClipStatus::Published));
        assert_eq!(ClipStatus::parse("weird"), None);
    }

    #[test]
    fn test_clip_json_shape() {
        let clip = Clip {
            id: "c1".into(),
            title: "Hook".into(),
            duration_seconds: 31.5,
            aspect_ratio: CLIP_ASPECT_RATIO.into(),
            quality: CLIP_QUALITY.into(),
            video_url: "https://cdn.example/c1.mp4".into(),
            thumbnail_url: String::new(),
            virality_score: 88,
            virality_reasoning: String::new(),
            transcript: String::new(),
            suggested_caption: String::new(),
            suggested_hashtags: vec!["#ai".into()],
            status: ClipStatus::Ready,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&clip).unwrap();
        assert_eq!(json["aspectRatio"], "9:16");
        assert_eq!(json["viralityScore"], 88);
        assert_eq!(json["status"], "ready");
    }
}
