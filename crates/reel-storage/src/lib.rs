//! Object storage for ReelPipe uploads.
//!
//! This crate provides:
//! - An R2 (S3-compatible) client issuing presigned PUT/GET URLs
//! - The upload key layout scoped by user and session
//! - [`PartPlanner`], which turns a declared file size into a presigned
//!   multipart write plan

pub mod client;
pub mod error;
pub mod keys;
pub mod planner;

pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use planner::{
    part_size_for, total_parts_for, PartPlanner, PartUrlSigner, PlanError, PlannerConfig,
    DEFAULT_MAX_FILE_SIZE, DEFAULT_URL_EXPIRY,
};
