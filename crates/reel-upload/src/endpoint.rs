//! Remote side of a transfer.

use std::collections::HashMap;

use async_trait::async_trait;
use reel_models::UploadId;

use crate::error::UploadResult;
use crate::fingerprint::FileInfo;

/// Everything an endpoint may need to know about the transfer.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub upload_id: UploadId,
    pub file: FileInfo,
    pub fingerprint: String,
    /// Extra request headers supplied by the caller
    pub headers: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// A partial object on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpload {
    /// Where the object lives once complete
    pub location: String,
    /// Bytes the endpoint has acknowledged
    pub offset: u64,
    /// Chunk size the endpoint requires, if it dictates one
    pub chunk_size: Option<u64>,
}

/// A resumable write target.
///
/// The transfer loop calls `locate` first; only when nothing resumable is
/// found does it `create`. Chunks are then written strictly in order and
/// `write_chunk` returns the new acknowledged offset. After a failed write
/// the loop re-reads `offset` and continues from there.
#[async_trait]
pub trait TransferEndpoint: Send + Sync {
    /// URL that identifies this endpoint in fingerprints.
    fn url(&self) -> &str;

    /// Find a prior partial upload for `ctx.fingerprint`.
    async fn locate(&self, ctx: &TransferContext) -> UploadResult<Option<RemoteUpload>>;

    async fn create(&self, ctx: &TransferContext) -> UploadResult<RemoteUpload>;

    async fn write_chunk(
        &self,
        ctx: &TransferContext,
        remote: &RemoteUpload,
        offset: u64,
        chunk: Vec<u8>,
    ) -> UploadResult<u64>;

    /// Bytes of `remote` the endpoint holds right now.
    ///
    /// Asked before retrying a failed chunk, since a write that failed
    /// mid-stream may still have stored part of the chunk.
    async fn offset(&self, ctx: &TransferContext, remote: &RemoteUpload) -> UploadResult<u64>;

    /// Called once every byte is acknowledged.
    async fn finalize(&self, ctx: &TransferContext, remote: &RemoteUpload) -> UploadResult<()>;

    /// Ask the endpoint to drop the partial object.
    async fn discard(&self, ctx: &TransferContext, remote: &RemoteUpload) -> UploadResult<()>;
}
