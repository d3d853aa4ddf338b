//! Resumable chunked upload client for ReelPipe.
//!
//! Moves multi-gigabyte source videos to remote storage without blocking
//! the caller:
//! - [`UploadWorker`] owns all in-flight transfers; callers drive it
//!   through an [`UploadHandle`] and read ordered [`UploadEvent`]s
//! - transfers resume from the last acknowledged offset when a partial
//!   upload with the same fingerprint exists
//! - each chunk is retried along a backoff ladder before the upload fails
//! - [`TusEndpoint`] speaks tus 1.0; [`PresignedPartEndpoint`] writes the
//!   parts of a presigned multipart plan

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod metrics;
pub mod plan_client;
pub mod presigned;
pub mod registry;
pub mod transfer;
pub mod tus;
pub mod worker;

pub use config::{parse_delays, UploadConfig, DEFAULT_RETRY_DELAYS};
pub use endpoint::{RemoteUpload, TransferContext, TransferEndpoint};
pub use error::{UploadError, UploadResult};
pub use event::{UploadEvent, UploadEvents};
pub use fingerprint::{fingerprint, FileInfo};
pub use plan_client::PlanClient;
pub use presigned::{CompletedPart, PresignedPartEndpoint, UploadManifest};
pub use registry::UploadRegistry;
pub use tus::{TusEndpoint, TUS_VERSION};
pub use worker::{StartUpload, UploadHandle, UploadWorker};
