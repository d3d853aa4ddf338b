//! Presigned multipart upload planner.
//!
//! Turns a declared file size into a time-bounded write plan: one signed PUT
//! URL per part plus one for the completion manifest, all bound to a single
//! synthetic upload id and a key namespaced by the caller and session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reel_models::{
    format_bytes, PartUploadPlan, PartUrl, PlanUploadRequest, GB, MAX_PART_SIZE_BYTES, MB,
    MIN_PART_SIZE_BYTES,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{StorageError, StorageResult};
use crate::keys;

/// Default lifetime of issued URLs.
pub const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(2 * 60 * 60);

/// Largest file a plan is issued for by default.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * GB;

/// Number of parts the planner aims for when the caller does not choose.
const TARGET_PARTS: u64 = 8;

/// Source of signed object-store URLs.
#[async_trait]
pub trait PartUrlSigner: Send + Sync {
    async fn sign_put(
        &self,
        key: &str,
        content_type: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String>;

    async fn sign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

/// Planning errors, mapped 1:1 to 401 / 400 / 500 by the API.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Failed to issue upload credentials: {0}")]
    Upstream(#[from] StorageError),
}

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub url_expiry: Duration,
    /// Declared sizes above this are rejected
    pub max_file_size: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            url_expiry: DEFAULT_URL_EXPIRY,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Self {
        let secs = std::env::var("UPLOAD_URL_EXPIRY_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_URL_EXPIRY.as_secs());
        let max_file_size = std::env::var("UPLOAD_MAX_FILE_SIZE_BYTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_MAX_FILE_SIZE);
        Self {
            url_expiry: Duration::from_secs(secs),
            max_file_size,
        }
    }
}

/// Choose the part size for a file.
///
/// A caller-supplied size is clamped into `[5MB, 100MB]`. Otherwise the file
/// is split into roughly eight parts, clamped the same way and rounded up to
/// a whole megabyte.
pub fn part_size_for(file_size_bytes: u64, requested: Option<u64>) -> u64 {
    match requested {
        Some(size) => size.clamp(MIN_PART_SIZE_BYTES, MAX_PART_SIZE_BYTES),
        None => {
            let target = file_size_bytes.div_ceil(TARGET_PARTS);
            let clamped = target.clamp(MIN_PART_SIZE_BYTES, MAX_PART_SIZE_BYTES);
            clamped.div_ceil(MB) * MB
        }
    }
}

/// `ceil(file_size / part_size)`, at least one part. `None` when the count
/// does not fit a part number.
pub fn total_parts_for(file_size_bytes: u64, part_size_bytes: u64) -> Option<u32> {
    let parts = file_size_bytes.div_ceil(part_size_bytes.max(1)).max(1);
    u32::try_from(parts).ok()
}

/// Issues [`PartUploadPlan`]s.
#[derive(Clone)]
pub struct PartPlanner {
    signer: Arc<dyn PartUrlSigner>,
    config: PlannerConfig,
}

impl PartPlanner {
    pub fn new(signer: Arc<dyn PartUrlSigner>, config: PlannerConfig) -> Self {
        Self { signer, config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Build a write plan for the authenticated caller.
    pub async fn plan_upload(
        &self,
        caller_uid: Option<&str>,
        request: &PlanUploadRequest,
    ) -> Result<PartUploadPlan, PlanError> {
        let uid = caller_uid
            .filter(|uid| !uid.is_empty())
            .ok_or(PlanError::Unauthenticated)?;

        let missing = request.missing_fields();
        if !missing.is_empty() {
            return Err(PlanError::InvalidArgument(format!(
                "Missing required field(s): {}",
                missing.join(", ")
            )));
        }
        request
            .validate()
            .map_err(|e| PlanError::InvalidArgument(e.to_string()))?;

        // Presence checked above.
        let file_name = request.file_name.as_deref().unwrap_or_default();
        let file_size = request.file_size_bytes.unwrap_or_default();
        let session_id = request.session_id.as_deref().unwrap_or_default();

        if file_size > self.config.max_file_size {
            return Err(PlanError::InvalidArgument(format!(
                "fileSizeBytes exceeds the {} limit",
                format_bytes(self.config.max_file_size)
            )));
        }

        let part_size = part_size_for(file_size, request.part_size);
        let total_parts = total_parts_for(file_size, part_size).ok_or_else(|| {
            PlanError::InvalidArgument(format!(
                "fileSizeBytes {} needs too many parts of {} bytes",
                file_size, part_size
            ))
        })?;

        let upload_id = Uuid::new_v4().simple().to_string();
        let prefix = keys::upload_prefix(uid, session_id, &upload_id)
            .map_err(|e| PlanError::InvalidArgument(e.to_string()))?;
        let storage_key = keys::object_key(&prefix, file_name);
        let expiry = self.config.url_expiry;

        let mut parts = Vec::with_capacity(total_parts as usize);
        for part_number in 1..=total_parts {
            let signed_url = self
                .signer
                .sign_put(&keys::part_key(&prefix, part_number), None, expiry)
                .await
                .inspect_err(|e| warn!(upload_id = %upload_id, part_number, "Part presign failed: {}", e))?;
            parts.push(PartUrl {
                part_number,
                signed_url,
            });
        }

        let completion_url = self
            .signer
            .sign_put(&keys::manifest_key(&prefix), None, expiry)
            .await?;

        let expires_at_epoch_seconds = Utc::now().timestamp() + expiry.as_secs() as i64;

        info!(
            upload_id = %upload_id,
            uid = %uid,
            session_id = %session_id,
            file_size,
            part_size,
            total_parts,
            "Issued multipart upload plan"
        );
        metrics::counter!("upload_plans_issued_total").increment(1);

        Ok(PartUploadPlan {
            upload_id,
            storage_key,
            parts,
            completion_url,
            part_size_bytes: part_size,
            total_parts,
            expires_at_epoch_seconds,
        })
    }

    /// Signed read URL for an uploaded object, e.g. as a provider source URL.
    pub async fn source_url(&self, storage_key: &str, expires_in: Duration) -> StorageResult<String> {
        self.signer.sign_get(storage_key, expires_in).await
    }
}
