//! Normalization of raw provider results into [`Clip`]s.
//!
//! Providers change field names between API versions, so every canonical
//! field is looked up under a list of aliases. Missing fields get a default
//! instead of failing the job.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;
use reel_models::{Clip, ClipStatus, ProviderJobId, CLIP_ASPECT_RATIO, CLIP_QUALITY};
use reel_provider::RawClip;
use serde_json::Value;
use sha2::{Digest, Sha256};

const ID_KEYS: &[&str] = &["id", "clipId", "clip_id", "videoId", "video_id"];
const TITLE_KEYS: &[&str] = &["title", "clipTitle", "clip_title", "name", "headline"];
const URL_KEYS: &[&str] = &[
    "videoUrl",
    "video_url",
    "url",
    "clipUrl",
    "clip_url",
    "downloadUrl",
    "download_url",
];
const THUMBNAIL_KEYS: &[&str] = &[
    "thumbnailUrl",
    "thumbnail_url",
    "thumbnail",
    "coverUrl",
    "cover_url",
    "cover",
];
const TRANSCRIPT_KEYS: &[&str] = &["transcript", "transcription", "text", "subtitle"];
const SCORE_KEYS: &[&str] = &[
    "viralityScore",
    "virality_score",
    "viralScore",
    "viral_score",
    "score",
];
const REASONING_KEYS: &[&str] = &[
    "viralityReasoning",
    "virality_reasoning",
    "reasoning",
    "reason",
    "explanation",
];
const CAPTION_KEYS: &[&str] = &["suggestedCaption", "suggested_caption", "caption", "description"];
const HASHTAG_KEYS: &[&str] = &["suggestedHashtags", "suggested_hashtags", "hashtags", "tags"];
const DURATION_KEYS: &[&str] = &["durationSeconds", "duration_seconds", "duration", "length"];
const START_KEYS: &[&str] = &["startTime", "start_time", "start"];
const END_KEYS: &[&str] = &["endTime", "end_time", "end"];

/// Range for synthesized scores when the provider sent none.
const FALLBACK_SCORE_MIN: u8 = 70;
const FALLBACK_SCORE_MAX: u8 = 95;

/// Hex chars of the URL digest used in derived clip ids.
const URL_DIGEST_LEN: usize = 12;

/// Normalize a provider result list, dropping repeated ids within the batch.
pub fn normalize_clips(provider_job_id: &ProviderJobId, raw: &[RawClip]) -> Vec<Clip> {
    let mut seen = HashSet::new();
    raw.iter()
        .enumerate()
        .map(|(index, item)| normalize_clip(provider_job_id, index, item))
        .filter(|clip| seen.insert(clip.id.clone()))
        .collect()
}

/// Normalize one provider result.
pub fn normalize_clip(provider_job_id: &ProviderJobId, index: usize, raw: &RawClip) -> Clip {
    let video_url = string_field(raw, URL_KEYS).unwrap_or_default();

    Clip {
        id: clip_id(provider_job_id, index, raw, &video_url),
        title: string_field(raw, TITLE_KEYS).unwrap_or_else(|| format!("Clip {}", index + 1)),
        duration_seconds: duration_field(raw),
        aspect_ratio: CLIP_ASPECT_RATIO.to_string(),
        quality: CLIP_QUALITY.to_string(),
        thumbnail_url: string_field(raw, THUMBNAIL_KEYS).unwrap_or_default(),
        virality_score: normalize_score(number_field(raw, SCORE_KEYS)),
        virality_reasoning: string_field(raw, REASONING_KEYS).unwrap_or_default(),
        transcript: string_field(raw, TRANSCRIPT_KEYS).unwrap_or_default(),
        suggested_caption: string_field(raw, CAPTION_KEYS).unwrap_or_default(),
        suggested_hashtags: hashtags_field(raw),
        status: string_field(raw, &["status"])
            .and_then(|s| ClipStatus::parse(&s.to_lowercase()))
            .unwrap_or(ClipStatus::Ready),
        created_at: string_field(raw, &["createdAt", "created_at"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
        video_url,
    }
}

/// Map a provider score onto 0-100.
///
/// `(10, 100]` is already on the target scale (clamped to 100), `[0, 10]` is
/// mapped linearly onto `[60, 100]`, and absent or negative scores get a
/// random value in `[70, 95]`.
pub fn normalize_score(raw: Option<f64>) -> u8 {
    match raw {
        Some(score) if score > 10.0 => score.min(100.0).round() as u8,
        Some(score) if score >= 0.0 => (score / 10.0 * 40.0 + 60.0).round() as u8,
        _ => rand::rng().random_range(FALLBACK_SCORE_MIN..=FALLBACK_SCORE_MAX),
    }
}

/// Stable id so poll and webhook copies of a clip collapse to one entry.
fn clip_id(provider_job_id: &ProviderJobId, index: usize, raw: &RawClip, video_url: &str) -> String {
    if let Some(id) = string_field(raw, ID_KEYS) {
        return id;
    }
    if !video_url.is_empty() {
        let digest = hex::encode(Sha256::digest(video_url.as_bytes()));
        return format!("{}-{}", provider_job_id, &digest[..URL_DIGEST_LEN]);
    }
    format!("{}-{}", provider_job_id, index)
}

fn lookup<'a>(raw: &'a RawClip, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .find(|v| !v.is_null())
}

/// Strings and numbers both count; empty strings do not.
fn string_field(raw: &RawClip, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match raw.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number_field(raw: &RawClip, keys: &[&str]) -> Option<f64> {
    let value = match lookup(raw, keys)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn duration_field(raw: &RawClip) -> f64 {
    if let Some(duration) = number_field(raw, DURATION_KEYS).filter(|d| *d >= 0.0) {
        return duration;
    }
    match (number_field(raw, START_KEYS), number_field(raw, END_KEYS)) {
        (Some(start), Some(end)) if end > start => end - start,
        _ => 0.0,
    }
}

fn hashtags_field(raw: &RawClip) -> Vec<String> {
    match lookup(raw, HASHTAG_KEYS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> ProviderJobId {
        ProviderJobId::from("p-42")
    }

    #[test]
    fn test_score_normalization_table() {
        assert_eq!(normalize_score(Some(7.0)), 88);
        assert_eq!(normalize_score(Some(0.0)), 60);
        assert_eq!(normalize_score(Some(10.0)), 100);
        assert_eq!(normalize_score(Some(55.0)), 55);
        assert_eq!(normalize_score(Some(100.0)), 100);
        assert_eq!(normalize_score(Some(140.0)), 100);
    }

    #[test]
    fn test_absent_or_negative_score_is_synthesized_in_range() {
        for _ in 0..200 {
            let absent = normalize_score(None);
            assert!((70..=95).contains(&absent), "absent -> {}", absent);
            let negative = normalize_score(Some(-3.0));
            assert!((70..=95).contains(&negative), "negative -> {}", negative);
        }
    }

    #[test]
    fn test_aliases_map_to_canonical_fields() {
        let raw = json!({
            "clip_id": "c-9",
            "name": "The hook",
            "url": "https://cdn.test/c9.mp4",
            "cover": "https://cdn.test/c9.jpg",
            "text": "hello world",
            "score": "8.5",
            "reason": "strong open",
            "caption": "watch this",
            "tags": "#ai #video,#shorts",
            "duration": 42.5,
            "status": "COMPLETED"
        });
        let clip = normalize_clip(&job(), 0, &raw);
        assert_eq!(clip.id, "c-9");
        assert_eq!(clip.title, "The hook");
        assert_eq!(clip.video_url, "https://cdn.test/c9.mp4");
        assert_eq!(clip.thumbnail_url, "https://cdn.test/c9.jpg");
        assert_eq!(clip.transcript, "hello world");
        assert_eq!(clip.virality_score, 94);
        assert_eq!(clip.virality_reasoning, "strong open");
        assert_eq!(clip.suggested_caption, "watch this");
        assert_eq!(clip.suggested_hashtags, vec!["#ai", "#video", "#shorts"]);
        assert_eq!(clip.duration_seconds, 42.5);
        assert_eq!(clip.status, ClipStatus::Ready);
        assert_eq!(clip.aspect_ratio, "9:16");
        assert_eq!(clip.quality, "1080p");
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let clip = normalize_clip(&job(), 2, &json!({}));
        assert_eq!(clip.id, "p-42-2");
        assert_eq!(clip.title, "Clip 3");
        assert_eq!(clip.duration_seconds, 0.0);
        assert!(clip.video_url.is_empty());
        assert!((70..=95).contains(&clip.virality_score));
    }

    #[test]
    fn test_duration_from_start_and_end() {
        let clip = normalize_clip(&job(), 0, &json!({ "startTime": 12.0, "endTime": 47.5 }));
        assert_eq!(clip.duration_seconds, 35.5);
    }

    #[test]
    fn test_derived_id_is_stable_across_channels() {
        let poll_copy = json!({ "videoUrl": "https://cdn.test/a.mp4", "score": 7 });
        let webhook_copy = json!({ "video_url": "https://cdn.test/a.mp4", "viralityScore": 7 });
        let a = normalize_clip(&job(), 0, &poll_copy);
        let b = normalize_clip(&job(), 3, &webhook_copy);
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("p-42-"));
        assert_eq!(a.id.len(), "p-42-".len() + 12);
    }

    #[test]
    fn test_batch_drops_repeated_ids() {
        let raw = vec![
            json!({ "id": "x", "title": "first" }),
            json!({ "id": "x", "title": "second" }),
            json!({ "id": "y" }),
        ];
        let clips = normalize_clips(&job(), &raw);
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[0].title, "first");
        assert_eq!(clips[1].id, "y");
    }
}
