//! Presigned multipart binding: parts go straight to object storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reel_models::{chunk_size_for, PartUploadPlan, PlanUploadRequest};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::endpoint::{RemoteUpload, TransferContext, TransferEndpoint};
use crate::error::{UploadError, UploadResult};
use crate::plan_client::PlanClient;

/// Plans this close to expiry are not offered for resume.
const RESUME_EXPIRY_MARGIN_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size_bytes: u64,
}

/// Completion manifest written to the plan's completion URL.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadManifest {
    pub upload_id: String,
    pub storage_key: String,
    /// `complete` or `aborted`
    pub status: &'static str,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub part_size_bytes: u64,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone)]
struct PartState {
    plan: PartUploadPlan,
    parts: Vec<CompletedPart>,
}

impl PartState {
    fn acknowledged(&self) -> u64 {
        self.parts.iter().map(|p| p.size_bytes).sum()
    }

    fn manifest(&self, ctx: &TransferContext, status: &'static str) -> UploadManifest {
        UploadManifest {
            upload_id: self.plan.upload_id.clone(),
            storage_key: self.plan.storage_key.clone(),
            status,
            file_name: ctx.file.name.clone(),
            content_type: ctx.file.mime.clone(),
            size_bytes: ctx.file.size,
            part_size_bytes: self.plan.part_size_bytes,
            parts: self.parts.clone(),
        }
    }
}

/// Uploads parts to the signed URLs of a [`PartUploadPlan`].
///
/// The plan fixes the chunk size. Acknowledged parts are tracked per
/// fingerprint so a restarted upload in the same process continues with
/// the next part while the plan's URLs are still valid.
pub struct PresignedPartEndpoint {
    planner: Arc<PlanClient>,
    http: Client,
    session_id: String,
    state: Mutex<HashMap<String, PartState>>,
}

impl PresignedPartEndpoint {
    pub fn new(
        planner: Arc<PlanClient>,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> UploadResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            planner,
            http,
            session_id: session_id.into(),
            state: Mutex::new(HashMap::new()),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HashMap<String, PartState>) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    async fn put_manifest(&self, url: &str, manifest: &UploadManifest) -> UploadResult<()> {
        let response = self.http.put(url).json(manifest).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::http(status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferEndpoint for PresignedPartEndpoint {
    fn url(&self) -> &str {
        self.planner.plan_url()
    }

    async fn locate(&self, ctx: &TransferContext) -> UploadResult<Option<RemoteUpload>> {
        let now = Utc::now().timestamp();
        Ok(self.with_state(|state| {
            let usable = state
                .get(&ctx.fingerprint)
                .map(|s| s.plan.expires_at_epoch_seconds - RESUME_EXPIRY_MARGIN_SECS > now);
            match usable {
                Some(true) => state.get(&ctx.fingerprint).map(|s| RemoteUpload {
                    location: s.plan.storage_key.clone(),
                    offset: s.acknowledged(),
                    chunk_size: Some(s.plan.part_size_bytes),
                }),
                Some(false) => {
                    state.remove(&ctx.fingerprint);
                    None
                }
                None => None,
            }
        }))
    }

    async fn create(&self, ctx: &TransferContext) -> UploadResult<RemoteUpload> {
        let plan = self
            .planner
            .request_plan(&PlanUploadRequest {
                file_name: Some(ctx.file.name.clone()),
                file_size_bytes: Some(ctx.file.size),
                content_type: Some(ctx.file.mime.clone()),
                session_id: Some(self.session_id.clone()),
                part_size: Some(chunk_size_for(ctx.file.size)),
            })
            .await?;

        if plan.parts.len() as u32 != plan.total_parts || plan.part_size_bytes == 0 {
            return Err(UploadError::protocol(format!(
                "plan {} lists {} part URLs for {} parts",
                plan.upload_id,
                plan.parts.len(),
                plan.total_parts
            )));
        }

        info!(
            upload_id = %ctx.upload_id,
            plan_upload_id = %plan.upload_id,
            total_parts = plan.total_parts,
            part_size = plan.part_size_bytes,
            "Created presigned upload plan"
        );

        let remote = RemoteUpload {
            location: plan.storage_key.clone(),
            offset: 0,
            chunk_size: Some(plan.part_size_bytes),
        };
        self.with_state(|state| {
            state.insert(
                ctx.fingerprint.clone(),
                PartState {
                    plan,
                    parts: Vec::new(),
                },
            )
        });
        Ok(remote)
    }

    async fn write_chunk(
        &self,
        ctx: &TransferContext,
        _remote: &RemoteUpload,
        offset: u64,
        chunk: Vec<u8>,
    ) -> UploadResult<u64> {
        let (part_number, url) = self
            .with_state(|state| {
                let s = state.get(&ctx.fingerprint)?;
                let part_size = s.plan.part_size_bytes;
                if offset % part_size != 0 {
                    return None;
                }
                let part_number = (offset / part_size) as u32 + 1;
                s.plan
                    .url_for_part(part_number)
                    .map(|u| (part_number, u.to_string()))
            })
            .ok_or_else(|| {
                UploadError::protocol(format!("no signed part covers offset {}", offset))
            })?;

        let size_bytes = chunk.len() as u64;
        let response = self.http.put(&url).body(chunk).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::http(status, body));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .ok_or_else(|| UploadError::protocol(format!("part {} stored without ETag", part_number)))?;

        debug!(upload_id = %ctx.upload_id, part_number, "Part stored");

        self.with_state(|state| {
            let s = state
                .get_mut(&ctx.fingerprint)
                .ok_or_else(|| UploadError::protocol("plan dropped during upload"))?;
            s.parts.retain(|p| p.part_number != part_number);
            s.parts.push(CompletedPart {
                part_number,
                etag,
                size_bytes,
            });
            s.parts.sort_by_key(|p| p.part_number);
            Ok(s.acknowledged())
        })
    }

    async fn offset(&self, ctx: &TransferContext, _remote: &RemoteUpload) -> UploadResult<u64> {
        self.with_state(|state| state.get(&ctx.fingerprint).map(PartState::acknowledged))
            .ok_or_else(|| UploadError::protocol("plan dropped during upload"))
    }

    async fn finalize(&self, ctx: &TransferContext, _remote: &RemoteUpload) -> UploadResult<()> {
        let state = self
            .with_state(|state| state.get(&ctx.fingerprint).cloned())
            .ok_or_else(|| UploadError::protocol("no plan to finalize"))?;

        self.put_manifest(&state.plan.completion_url, &state.manifest(ctx, "complete"))
            .await?;
        self.with_state(|s| s.remove(&ctx.fingerprint));
        Ok(())
    }

    async fn discard(&self, ctx: &TransferContext, _remote: &RemoteUpload) -> UploadResult<()> {
        let Some(state) = self.with_state(|s| s.remove(&ctx.fingerprint)) else {
            return Ok(());
        };
        self.put_manifest(&state.plan.completion_url, &state.manifest(ctx, "aborted"))
            .await
    }
}
