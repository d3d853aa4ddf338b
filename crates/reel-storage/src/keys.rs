//! Object key layout for uploads.
//!
//! ```text
//! uploads/{uid}/{sessionId}/{uploadId}/{safeName}        final object
//! uploads/{uid}/{sessionId}/{uploadId}/parts/{nnnnn}     one per part
//! uploads/{uid}/{sessionId}/{uploadId}/manifest.json     completion manifest
//! ```

use crate::error::{StorageError, StorageResult};

const UPLOADS_PREFIX: &str = "uploads";

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
///
/// Leading dots are stripped so a name can never address a parent segment.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validate a path segment supplied by a caller (uid, session id).
fn segment(value: &str, what: &str) -> StorageResult<String> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if ok {
        Ok(value.to_string())
    } else {
        Err(StorageError::InvalidKey(format!("invalid {}: {:?}", what, value)))
    }
}

/// Key prefix shared by every object of one upload.
pub fn upload_prefix(uid: &str, session_id: &str, upload_id: &str) -> StorageResult<String> {
    Ok(format!(
        "{}/{}/{}/{}",
        UPLOADS_PREFIX,
        segment(uid, "uid")?,
        segment(session_id, "session id")?,
        segment(upload_id, "upload id")?
    ))
}

pub fn object_key(prefix: &str, file_name: &str) -> String {
    format!("{}/{}", prefix, sanitize_file_name(file_name))
}

pub fn part_key(prefix: &str, part_number: u32) -> String {
    format!("{}/parts/{:05}", prefix, part_number)
}

pub fn manifest_key(prefix: &str) -> String {
    format!("{}/manifest.json", prefix)
}

/// True if `key` lives under the caller's upload namespace.
pub fn is_owned_by(key: &str, uid: &str) -> bool {
    let prefix = format!("{}/{}/", UPLOADS_PREFIX, uid);
    key.starts_with(&prefix) && !key.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("My Talk (final).mp4"), "My_Talk__final_.mp4");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name("clip-01_v2.MOV"), "clip-01_v2.MOV");
    }

    #[test]
    fn test_key_layout() {
        let prefix = upload_prefix("user1", "sess-1", "abc").unwrap();
        assert_eq!(prefix, "uploads/user1/sess-1/abc");
        assert_eq!(object_key(&prefix, "a b.mp4"), "uploads/user1/sess-1/abc/a_b.mp4");
        assert_eq!(part_key(&prefix, 7), "uploads/user1/sess-1/abc/parts/00007");
        assert_eq!(manifest_key(&prefix), "uploads/user1/sess-1/abc/manifest.json");
    }

    #[test]
    fn test_rejects_bad_segments() {
        assert!(upload_prefix("user/1", "s", "u").is_err());
        assert!(upload_prefix("user", "", "u").is_err());
        assert!(upload_prefix("user", "s", "..").is_err());
    }

    #[test]
    fn test_ownership() {
        assert!(is_owned_by("uploads/user1/s/u/a.mp4", "user1"));
        assert!(!is_owned_by("uploads/user10/s/u/a.mp4", "user1"));
        assert!(!is_owned_by("uploads/user1/../user2/a.mp4", "user1"));
    }
}
