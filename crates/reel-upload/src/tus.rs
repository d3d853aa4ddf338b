//! tus 1.0 resumable upload binding.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::endpoint::{RemoteUpload, TransferContext, TransferEndpoint};
use crate::error::{UploadError, UploadResult};

pub const TUS_VERSION: &str = "1.0.0";

const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Client for a tus creation endpoint.
///
/// Upload URLs returned by `create` are remembered per fingerprint (clones
/// share the table); `locate` confirms a remembered URL with `HEAD` before
/// offering it for resume. With [`TusEndpoint::with_resume_file`] the table
/// is loaded from and written back to a JSON file so a later process can
/// resume.
#[derive(Clone)]
pub struct TusEndpoint {
    http: Client,
    url: String,
    known: Arc<Mutex<HashMap<String, String>>>,
    resume_file: Option<Arc<ResumeFile>>,
}

struct ResumeFile {
    path: PathBuf,
    writing: tokio::sync::Mutex<()>,
}

impl TusEndpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> UploadResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(url, http))
    }

    pub fn with_client(url: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            url: url.into(),
            known: Arc::new(Mutex::new(HashMap::new())),
            resume_file: None,
        }
    }

    /// Load the resume table from `path` and keep it in sync from now on.
    /// A missing file starts empty; an unreadable one is logged and replaced.
    pub async fn with_resume_file(mut self, path: impl Into<PathBuf>) -> UploadResult<Self> {
        let path = path.into();
        let loaded = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(table) => table,
                Err(e) => {
                    warn!(path = %path.display(), "Ignoring unreadable resume file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = loaded.len(), "Loaded tus resume table");
        {
            let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            known.extend(loaded);
        }
        self.resume_file = Some(Arc::new(ResumeFile {
            path,
            writing: tokio::sync::Mutex::new(()),
        }));
        Ok(self)
    }

    /// Seed the resume table, e.g. from a previous process.
    pub fn remember(&self, fingerprint: impl Into<String>, location: impl Into<String>) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.insert(fingerprint.into(), location.into());
    }

    pub fn known_location(&self, fingerprint: &str) -> Option<String> {
        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.get(fingerprint).cloned()
    }

    fn forget(&self, fingerprint: &str) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.remove(fingerprint);
    }

    /// Write the table to the resume file, if any. Failures only cost the
    /// ability to resume, so they are logged rather than returned.
    async fn persist(&self) {
        let Some(file) = &self.resume_file else {
            return;
        };
        let _writing = file.writing.lock().await;
        let snapshot = {
            let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            known.clone()
        };
        if let Err(e) = write_table(&file.path, &snapshot).await {
            warn!(path = %file.path.display(), "Failed to save tus resume table: {}", e);
        }
    }

    fn request(&self, method: Method, url: &str, ctx: &TransferContext) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION);
        for (name, value) in &ctx.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    fn resolve_location(&self, location: &str) -> UploadResult<String> {
        let base = Url::parse(&self.url)
            .map_err(|e| UploadError::invalid_argument(format!("bad endpoint url: {}", e)))?;
        base.join(location)
            .map(|u| u.to_string())
            .map_err(|e| UploadError::protocol(format!("bad Location header '{}': {}", location, e)))
    }
}

/// `Upload-Metadata` value: comma-separated `key base64(value)` pairs.
pub fn encode_metadata(ctx: &TransferContext) -> String {
    let mut pairs: Vec<(String, String)> = vec![
        ("filename".to_string(), ctx.file.name.clone()),
        ("filetype".to_string(), ctx.file.mime.clone()),
        ("fingerprint".to_string(), ctx.fingerprint.clone()),
    ];
    let mut extra: Vec<_> = ctx
        .metadata
        .iter()
        .filter(|(k, _)| !k.is_empty() && !k.contains(|c: char| c == ' ' || c == ','))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    extra.sort();
    pairs.extend(extra);

    pairs
        .iter()
        .map(|(k, v)| format!("{} {}", k, STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Replace `path` with the JSON table via a sibling temp file.
async fn write_table(path: &Path, table: &HashMap<String, String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(table)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

async fn unexpected(response: Response) -> UploadError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    UploadError::http(status, body)
}

#[async_trait]
impl TransferEndpoint for TusEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn locate(&self, ctx: &TransferContext) -> UploadResult<Option<RemoteUpload>> {
        let Some(location) = self.known_location(&ctx.fingerprint) else {
            return Ok(None);
        };

        let response = self.request(Method::HEAD, &location, ctx).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN => {
                debug!(upload_id = %ctx.upload_id, "Remembered upload is gone, starting over");
                self.forget(&ctx.fingerprint);
                self.persist().await;
                return Ok(None);
            }
            s if !s.is_success() => return Err(unexpected(response).await),
            _ => {}
        }

        if let Some(length) = header_u64(&response, HEADER_UPLOAD_LENGTH) {
            if length != ctx.file.size {
                warn!(
                    upload_id = %ctx.upload_id,
                    "Remote length {} does not match file size {}, starting over",
                    length,
                    ctx.file.size
                );
                self.forget(&ctx.fingerprint);
                self.persist().await;
                return Ok(None);
            }
        }

        let offset = header_u64(&response, HEADER_UPLOAD_OFFSET)
            .ok_or_else(|| UploadError::protocol("HEAD response without Upload-Offset"))?;

        Ok(Some(RemoteUpload {
            location,
            offset,
            chunk_size: None,
        }))
    }

    async fn create(&self, ctx: &TransferContext) -> UploadResult<RemoteUpload> {
        let response = self
            .request(Method::POST, &self.url, ctx)
            .header(HEADER_UPLOAD_LENGTH, ctx.file.size.to_string())
            .header(HEADER_UPLOAD_METADATA, encode_metadata(ctx))
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(unexpected(response).await);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| UploadError::protocol("create response without Location"))?;
        let location = self.resolve_location(location)?;

        info!(upload_id = %ctx.upload_id, location = %location, "Created tus upload");
        self.remember(ctx.fingerprint.clone(), location.clone());
        self.persist().await;

        Ok(RemoteUpload {
            location,
            offset: 0,
            chunk_size: None,
        })
    }

    async fn write_chunk(
        &self,
        ctx: &TransferContext,
        remote: &RemoteUpload,
        offset: u64,
        chunk: Vec<u8>,
    ) -> UploadResult<u64> {
        let response = self
            .request(Method::PATCH, &remote.location, ctx)
            .header(HEADER_UPLOAD_OFFSET, offset.to_string())
            .header(reqwest::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE)
            .body(chunk)
            .send()
            .await?;

        if !matches!(response.status(), StatusCode::NO_CONTENT | StatusCode::OK) {
            return Err(unexpected(response).await);
        }

        header_u64(&response, HEADER_UPLOAD_OFFSET)
            .ok_or_else(|| UploadError::protocol("PATCH response without Upload-Offset"))
    }

    async fn offset(&self, ctx: &TransferContext, remote: &RemoteUpload) -> UploadResult<u64> {
        let response = self
            .request(Method::HEAD, &remote.location, ctx)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(unexpected(response).await);
        }
        header_u64(&response, HEADER_UPLOAD_OFFSET)
            .ok_or_else(|| UploadError::protocol("HEAD response without Upload-Offset"))
    }

    async fn finalize(&self, ctx: &TransferContext, _remote: &RemoteUpload) -> UploadResult<()> {
        // The last PATCH completes a tus upload; nothing left to resume.
        self.forget(&ctx.fingerprint);
        self.persist().await;
        Ok(())
    }

    async fn discard(&self, ctx: &TransferContext, remote: &RemoteUpload) -> UploadResult<()> {
        self.forget(&ctx.fingerprint);
        self.persist().await;
        let response = self
            .request(Method::DELETE, &remote.location, ctx)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(()),
            _ => Err(unexpected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FileInfo;
    use reel_models::UploadId;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx(size: u64) -> TransferContext {
        TransferContext {
            upload_id: UploadId::from("u-1"),
            file: FileInfo {
                path: "/tmp/talk.mp4".into(),
                name: "talk.mp4".into(),
                mime: "video/mp4".into(),
                size,
                modified_ms: 1,
            },
            fingerprint: "fp-1".into(),
            headers: HashMap::from([("X-Session".to_string(), "s-1".to_string())]),
            metadata: HashMap::from([("sessionId".to_string(), "s-1".to_string())]),
        }
    }

    #[test]
    fn test_metadata_encoding() {
        let encoded = encode_metadata(&ctx(10));
        assert!(encoded.starts_with("filename dGFsay5tcDQ=,filetype dmlkZW8vbXA0,"));
        assert!(encoded.ends_with(",sessionId cy0x"));
    }

    #[tokio::test]
    async fn test_create_resolves_relative_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/"))
            .and(header("Tus-Resumable", TUS_VERSION))
            .and(header("Upload-Length", "10"))
            .and(header("X-Session", "s-1"))
            .respond_with(ResponseTemplate::new(201).insert_header("Location", "/files/abc"))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = TusEndpoint::new(format!("{}/files/", server.uri()), Duration::from_secs(5))
            .unwrap();
        let remote = endpoint.create(&ctx(10)).await.unwrap();
        assert_eq!(remote.location, format!("{}/files/abc", server.uri()));
        assert_eq!(remote.offset, 0);
        assert_eq!(endpoint.known_location("fp-1"), Some(remote.location));
    }

    #[tokio::test]
    async fn test_locate_forgets_gone_upload() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/files/old"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let endpoint = TusEndpoint::new(format!("{}/files/", server.uri()), Duration::from_secs(5))
            .unwrap();
        endpoint.remember("fp-1", format!("{}/files/old", server.uri()));

        assert!(endpoint.locate(&ctx(10)).await.unwrap().is_none());
        assert!(endpoint.known_location("fp-1").is_none());
    }

    #[tokio::test]
    async fn test_locate_reports_offset() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/files/abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Upload-Offset", "6")
                    .insert_header("Upload-Length", "10"),
            )
            .mount(&server)
            .await;

        let endpoint = TusEndpoint::new(format!("{}/files/", server.uri()), Duration::from_secs(5))
            .unwrap();
        endpoint.remember("fp-1", format!("{}/files/abc", server.uri()));

        let remote = endpoint.locate(&ctx(10)).await.unwrap().unwrap();
        assert_eq!(remote.offset, 6);
    }

    #[tokio::test]
    async fn test_patch_requires_offset_header() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/files/abc"))
            .and(header("Upload-Offset", "0"))
            .and(header("Content-Type", OFFSET_CONTENT_TYPE))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let endpoint = TusEndpoint::new(format!("{}/files/", server.uri()), Duration::from_secs(5))
            .unwrap();
        let remote = RemoteUpload {
            location: format!("{}/files/abc", server.uri()),
            offset: 0,
            chunk_size: None,
        };
        let err = endpoint
            .write_chunk(&ctx(10), &remote, 0, vec![1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_resume_file_survives_restart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files/"))
            .respond_with(ResponseTemplate::new(201).insert_header("Location", "/files/abc"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let resume = dir.path().join("state").join("resume.json");
        let url = format!("{}/files/", server.uri());

        let first = TusEndpoint::new(url.clone(), Duration::from_secs(5))
            .unwrap()
            .with_resume_file(&resume)
            .await
            .unwrap();
        let remote = first.create(&ctx(10)).await.unwrap();
        drop(first);

        let second = TusEndpoint::new(url.clone(), Duration::from_secs(5))
            .unwrap()
            .with_resume_file(&resume)
            .await
            .unwrap();
        assert_eq!(second.known_location("fp-1"), Some(remote.location.clone()));

        second.finalize(&ctx(10), &remote).await.unwrap();
        let third = TusEndpoint::new(url, Duration::from_secs(5))
            .unwrap()
            .with_resume_file(&resume)
            .await
            .unwrap();
        assert!(third.known_location("fp-1").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_resume_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resume = dir.path().join("resume.json");
        std::fs::write(&resume, b"not json").unwrap();

        let endpoint = TusEndpoint::new("http://localhost/files/", Duration::from_secs(5))
            .unwrap()
            .with_resume_file(&resume)
            .await
            .unwrap();
        assert!(endpoint.known_location("fp-1").is_none());
    }
}
