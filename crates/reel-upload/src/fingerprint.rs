//! Local file description and resume fingerprint.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{UploadError, UploadResult};

/// What the client knows about the file being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub modified_ms: u64,
}

impl FileInfo {
    /// Stat a file on disk.
    pub async fn from_path(path: impl AsRef<Path>) -> UploadResult<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::invalid_argument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            mime: mime_for(&name),
            name,
            size: metadata.len(),
            modified_ms,
        })
    }
}

/// Content type guessed from the file extension.
pub fn mime_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Stable identity of a (file, endpoint) pair.
///
/// Two runs against the same unchanged file and endpoint produce the same
/// value, which is what lets a restarted upload find its partial object.
pub fn fingerprint(file: &FileInfo, endpoint_url: &str) -> String {
    format!(
        "reel-{}-{}-{}-{}-{}",
        file.name, file.mime, file.size, file.modified_ms, endpoint_url
    )
}
