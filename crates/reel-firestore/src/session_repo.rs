//! Content session repository.
//!
//! One document per session at `{collection}/{sessionId}`:
//!
//! | field             | type      |
//! |-------------------|-----------|
//! | `session_id`      | string    |
//! | `owner_id`        | string    |
//! | `provider_job_id` | string?   | top-level copy for webhook lookup |
//! | `job`             | map?      |
//! | `clips`           | array     | ordered, always written whole |
//! | `updated_at`      | timestamp |
//!
//! The document `updateTime` is exposed as the record version and every
//! write is conditional on it.

use std::collections::HashMap;

use chrono::Utc;
use reel_models::{Clip, ProcessingJob, ProviderJobId, SessionId, SessionRecord};
use tracing::debug;

use crate::client::{FirestoreClient, WritePrecondition};
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{
    json_to_value, value_to_json, Document, FromFirestoreValue, StructuredQuery, ToFirestoreValue,
    Value,
};

/// Default collection for content sessions.
pub const DEFAULT_SESSIONS_COLLECTION: &str = "content_sessions";

const FIELDS: &[&str] = &[
    "session_id",
    "owner_id",
    "provider_job_id",
    "job",
    "clips",
    "updated_at",
];

/// Repository for [`SessionRecord`]s.
#[derive(Clone)]
pub struct SessionRepository {
    client: FirestoreClient,
    collection: String,
}

impl SessionRepository {
    pub fn new(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Use `FIRESTORE_SESSIONS_COLLECTION` or the default collection.
    pub fn from_env(client: FirestoreClient) -> Self {
        let collection = std::env::var("FIRESTORE_SESSIONS_COLLECTION")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSIONS_COLLECTION.to_string());
        Self::new(client, collection)
    }

    pub fn client(&self) -> &FirestoreClient {
        &self.client
    }

    /// Load a session with its current version.
    pub async fn get(&self, session_id: &SessionId) -> FirestoreResult<Option<SessionRecord>> {
        let doc = self
            .client
            .get_document(&self.collection, session_id.as_str())
            .await?;
        doc.map(|d| document_to_record(&d)).transpose()
    }

    /// Find the session whose active job has this provider id.
    pub async fn find_by_provider_job(
        &self,
        provider_job_id: &ProviderJobId,
    ) -> FirestoreResult<Option<SessionRecord>> {
        let query = StructuredQuery::field_equals(
            &self.collection,
            "provider_job_id",
            provider_job_id.as_str().to_firestore_value(),
            1,
        );
        let docs = self.client.run_query(query).await?;
        docs.first().map(document_to_record).transpose()
    }

    /// Write the whole record if its version is still current.
    ///
    /// A record without a version must not exist yet. Returns the new
    /// version; a lost race yields [`FirestoreError::PreconditionFailed`].
    pub async fn compare_and_set(&self, record: &SessionRecord) -> FirestoreResult<String> {
        let precondition = match &record.version {
            Some(version) => WritePrecondition::UpdateTime(version.clone()),
            None => WritePrecondition::Exists(false),
        };

        let doc = self
            .client
            .update_document_with_precondition(
                &self.collection,
                record.session_id.as_str(),
                record_to_fields(record)?,
                Some(FIELDS.iter().map(|f| f.to_string()).collect()),
                precondition,
            )
            .await?;

        debug!(session_id = %record.session_id, "Session record written");
        doc.update_time
            .ok_or_else(|| FirestoreError::invalid_response("write returned no updateTime"))
    }
}

fn record_to_fields(record: &SessionRecord) -> FirestoreResult<HashMap<String, Value>> {
    let mut fields = HashMap::new();
    fields.insert(
        "session_id".to_string(),
        record.session_id.as_str().to_firestore_value(),
    );
    fields.insert(
        "owner_id".to_string(),
        record.owner_id.as_str().to_firestore_value(),
    );
    fields.insert(
        "provider_job_id".to_string(),
        record
            .job
            .as_ref()
            .map(|j| j.provider_job_id.as_str())
            .to_firestore_value(),
    );
    let job = match &record.job {
        Some(job) => json_to_value(&serde_json::to_value(job)?),
        None => Value::NullValue(()),
    };
    fields.insert("job".to_string(), job);
    fields.insert(
        "clips".to_string(),
        json_to_value(&serde_json::to_value(&record.clips)?),
    );
    fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());
    Ok(fields)
}

fn document_to_record(doc: &Document) -> FirestoreResult<SessionRecord> {
    let session_id = doc
        .field("session_id")
        .and_then(String::from_firestore_value)
        .or_else(|| doc.doc_id().map(str::to_string))
        .ok_or_else(|| FirestoreError::invalid_response("session document without id"))?;

    let owner_id = doc
        .field("owner_id")
        .and_then(String::from_firestore_value)
        .unwrap_or_default();

    let job: Option<ProcessingJob> = match doc.field("job") {
        None | Some(Value::NullValue(())) => None,
        Some(value) => Some(serde_json::from_value(value_to_json(value))?),
    };

    let clips: Vec<Clip> = match doc.field("clips") {
        Some(value) => serde_json::from_value(value_to_json(value))?,
        None => Vec::new(),
    };

    Ok(SessionRecord {
        session_id: SessionId::from(session_id),
        owner_id,
        job,
        clips,
        version: doc.update_time.clone(),
    })
}
