//! Presigned multipart upload plan.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::MB;

/// Smallest part the object store accepts (except for the final part).
pub const MIN_PART_SIZE_BYTES: u64 = 5 * MB;

/// Largest part we hand out.
pub const MAX_PART_SIZE_BYTES: u64 = 100 * MB;

/// A signed write credential for one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    /// 1-based part number
    pub part_number: u32,
    pub signed_url: String,
}

/// Immutable write plan for one file.
///
/// Invariants: `total_parts == ceil(file_size / part_size_bytes)` and
/// `MIN_PART_SIZE_BYTES <= part_size_bytes <= MAX_PART_SIZE_BYTES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartUploadPlan {
    pub upload_id: String,
    /// Object key of the finalized file
    pub storage_key: String,
    /// Ordered by part number
    pub parts: Vec<PartUrl>,
    pub completion_url: String,
    pub part_size_bytes: u64,
    pub total_parts: u32,
    pub expires_at_epoch_seconds: i64,
}

impl PartUploadPlan {
    /// Byte range `[start, end)` covered by a 1-based part number.
    pub fn part_range(&self, part_number: u32, file_size: u64) -> Option<(u64, u64)> {
        if part_number == 0 || part_number > self.total_parts {
            return None;
        }
        let start = (part_number as u64 - 1) * self.part_size_bytes;
        let end = (start + self.part_size_bytes).min(file_size);
        Some((start, end))
    }

    /// Signed URL for a 1-based part number.
    pub fn url_for_part(&self, part_number: u32) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.part_number == part_number)
            .map(|p| p.signed_url.as_str())
    }
}

/// Request body of the presigned multipart API.
///
/// Every field is optional on the wire so that a missing field surfaces as a
/// 400 naming the field rather than a deserialization rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanUploadRequest {
    #[validate(length(min = 1, max = 1024))]
    pub file_name: Option<String>,
    #[validate(range(min = 1))]
    pub file_size_bytes: Option<u64>,
    #[validate(length(min = 1, max = 255))]
    pub content_type: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
}

impl PlanUploadRequest {
    /// Names of required fields that are absent or empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.file_name.as_deref().map(str::is_empty).unwrap_or(true) {
            missing.push("fileName");
        }
        if self.file_size_bytes.unwrap_or(0) == 0 {
            missing.push("fileSizeBytes");
        }
        if self.content_type.as_deref().map(str::is_empty).unwrap_or(true) {
            missing.push("contentType");
        }
        if self.session_id.as_deref().map(str::is_empty).unwrap_or(true) {
            missing.push("sessionId");
        }
        missing
    }
}

/// Response body of the presigned multipart API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanUploadResponse {
    pub upload_id: String,
    pub part_urls: Vec<String>,
    pub complete_url: String,
    pub part_size: u64,
    pub total_parts: u32,
    /// Seconds until the signed URLs expire
    pub expires_in: u64,
    pub storage_key: String,
    pub expires_at_epoch_seconds: i64,
}

impl PlanUploadResponse {
    /// Build the wire response from a plan issued at `now_epoch_seconds`.
    pub fn from_plan(plan: &PartUploadPlan, now_epoch_seconds: i64) -> Self {
        Self {
            upload_id: plan.upload_id.clone(),
            part_urls: plan.parts.iter().map(|p| p.signed_url.clone()).collect(),
            complete_url: plan.completion_url.clone(),
            part_size: plan.part_size_bytes,
            total_parts: plan.total_parts,
            expires_in: (plan.expires_at_epoch_seconds - now_epoch_seconds).max(0) as u64,
            storage_key: plan.storage_key.clone(),
            expires_at_epoch_seconds: plan.expires_at_epoch_seconds,
        }
    }

    /// Rebuild the plan on the client side.
    pub fn into_plan(self) -> PartUploadPlan {
        let parts = self
            .part_urls
            .into_iter()
            .enumerate()
            .map(|(i, signed_url)| PartUrl {
                part_number: i as u32 + 1,
                signed_url,
            })
            .collect();

        PartUploadPlan {
            upload_id: self.upload_id,
            storage_key: self.storage_key,
            parts,
            completion_url: self.complete_url,
            part_size_bytes: self.part_size,
            total_parts: self.total_parts,
            expires_at_epoch_seconds: self.expires_at_epoch_seconds,
        }
    }
}
