//! Shared data models for the ReelPipe pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Content sessions and client-side upload sessions
//! - Presigned multipart upload plans
//! - Processing jobs tracked against the external clip provider
//! - Generated clips

pub mod clip;
pub mod job;
pub mod plan;
pub mod session;
pub mod upload;
pub mod utils;

// Re-export common types
pub use clip::{Clip, ClipStatus, CLIP_ASPECT_RATIO, CLIP_QUALITY};
pub use job::{JobStatus, ProcessingJob, ProviderJobId};
pub use plan::{
    PartUploadPlan, PartUrl, PlanUploadRequest, PlanUploadResponse, MAX_PART_SIZE_BYTES,
    MIN_PART_SIZE_BYTES,
};
pub use session::{SessionId, SessionRecord};
pub use upload::{chunk_size_for, UploadId, UploadState, UploadStatus};
pub use utils::{format_bytes, GB, MB};
