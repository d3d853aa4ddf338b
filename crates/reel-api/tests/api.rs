//! Router tests: envelope, auth, planning, submission, webhooks and reads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use reel_api::handlers::webhooks::{sign, SIGNATURE_HEADER};
use reel_api::{create_router, ApiConfig, AppState, TokenVerifier, WEBHOOK_ROUTE};
use reel_models::{JobStatus, ProcessingJob, ProviderJobId, SessionId, SessionRecord};
use reel_provider::{HttpClipProvider, ProviderConfig};
use reel_reconcile::{JobService, MemoryJobStore, ReconcileConfig, Reconciler, WEBHOOK_PATH};
use reel_storage::{PartPlanner, PartUrlSigner, PlannerConfig, StorageResult};

const SECRET: &str = "test-signing-secret";

struct FakeSigner;

#[async_trait]
impl PartUrlSigner for FakeSigner {
    async fn sign_put(
        &self,
        key: &str,
        _content_type: Option<&str>,
        _expires_in: Duration,
    ) -> StorageResult<String> {
        Ok(format!("https://r2.test/{}?sig=put", key))
    }

    async fn sign_get(&self, key: &str, _expires_in: Duration) -> StorageResult<String> {
        Ok(format!("https://r2.test/{}?sig=get", key))
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryJobStore>,
    jobs: Arc<JobService>,
    server: MockServer,
}

async fn harness(webhook_secret: Option<&str>) -> Harness {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryJobStore::new());
    let provider = HttpClipProvider::new(ProviderConfig {
        base_url: server.uri(),
        api_key: "k".into(),
        timeout: Duration::from_secs(2),
        max_retries: 0,
    })
    .unwrap();
    let engine = Arc::new(Reconciler::new(
        store.clone(),
        ReconcileConfig {
            poll_interval: Duration::from_secs(3600),
            ..ReconcileConfig::default()
        },
    ));
    let jobs = Arc::new(JobService::new(engine, Arc::new(provider)));

    let config = ApiConfig {
        jwt_secret: Some(SECRET.into()),
        webhook_secret: webhook_secret.map(str::to_string),
        rate_limit_rps: 1000,
        rate_limit_burst: 1000,
        ..ApiConfig::default()
    };
    let verifier = TokenVerifier::from_config(&config).unwrap();
    let planner = PartPlanner::new(Arc::new(FakeSigner), PlannerConfig::default());
    let state = AppState::new(config, planner, jobs.clone(), verifier);

    Harness {
        app: create_router(state, None),
        store,
        jobs,
        server,
    }
}

fn bearer(uid: &str) -> String {
    let claims = json!({ "sub": uid, "exp": chrono::Utc::now().timestamp() + 600 });
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

fn json_request(method: Method, uri: &str, uid: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(uid) = uid {
        builder = builder.header(header::AUTHORIZATION, bearer(uid));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str, uid: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(uid) = uid {
        builder = builder.header(header::AUTHORIZATION, bearer(uid));
    }
    builder.body(Body::empty()).unwrap()
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn webhook_uri() -> String {
    format!("/api{}", WEBHOOK_ROUTE)
}

fn seed_bound_session(store: &MemoryJobStore, session: &str, owner: &str, job: &str) {
    let mut record = SessionRecord::new(SessionId::from(session), owner);
    record.job = Some(ProcessingJob::submitted(
        SessionId::from(session),
        ProviderJobId::from(job),
    ));
    store.insert(record);
}

async fn mount_submit(server: &MockServer, job_id: &str) {
    Mock::given(method("POST"))
        .and(path("/project/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 2000,
            "projectId": job_id
        })))
        .mount(server)
        .await;
}

async fn mount_processing(server: &MockServer, job_id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/project/query/{}", job_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 1000 })))
        .mount(server)
        .await;
}

#[test]
fn test_webhook_route_matches_callback_path() {
    assert_eq!(webhook_uri(), WEBHOOK_PATH);
}

#[tokio::test]
async fn test_health_and_ready() {
    let h = harness(None).await;
    let (status, body) = call(&h.app, get_request("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(&h.app, get_request("/ready", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["store"]["status"], "ok");
    assert_eq!(body["checks"]["storage"]["status"], "skipped");
}

#[tokio::test]
async fn test_unknown_route_and_wrong_verb_use_envelope() {
    let h = harness(None).await;

    let (status, body) = call(&h.app, get_request("/api/nope", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, body) = call(&h.app, get_request("/api/jobs", None)).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Method not allowed");
}

#[tokio::test]
async fn test_plan_requires_authentication() {
    let h = harness(None).await;
    let request = json_request(
        Method::POST,
        "/api/uploads/plan",
        None,
        json!({
            "fileName": "talk.mp4",
            "fileSizeBytes": 1024,
            "contentType": "video/mp4",
            "sessionId": "s-1"
        }),
    );
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_plan_names_missing_field() {
    let h = harness(None).await;
    let request = json_request(
        Method::POST,
        "/api/uploads/plan",
        Some("u-1"),
        json!({ "fileSizeBytes": 1024, "contentType": "video/mp4", "sessionId": "s-1" }),
    );
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("fileName"));
}

#[tokio::test]
async fn test_plan_issues_part_urls_under_callers_prefix() {
    let h = harness(None).await;
    let request = json_request(
        Method::POST,
        "/api/uploads/plan",
        Some("u-1"),
        json!({
            "fileName": "talk.mp4",
            "fileSizeBytes": 20 * 1024 * 1024,
            "contentType": "video/mp4",
            "sessionId": "s-1"
        }),
    );
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let total = body["totalParts"].as_u64().unwrap();
    let urls = body["partUrls"].as_array().unwrap();
    assert_eq!(urls.len() as u64, total);
    assert!(body["partSize"].as_u64().unwrap() >= 5 * 1024 * 1024);
    assert!(body["storageKey"]
        .as_str()
        .unwrap()
        .starts_with("uploads/u-1/s-1/"));
    assert!(body["completeUrl"]
        .as_str()
        .unwrap()
        .contains("manifest.json"));
    assert!(body["expiresIn"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_malformed_body_is_400_envelope() {
    let h = harness(None).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, bearer("u-1"))
        .body(Body::from("{"))
        .unwrap();
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_submit_signs_uploaded_source_and_guards_duplicates() {
    let h = harness(None).await;
    mount_submit(&h.server, "p-1").await;
    mount_processing(&h.server, "p-1").await;

    let submit = json!({
        "sessionId": "s-1",
        "storageKey": "uploads/u-1/s-1/abc/talk.mp4",
        "preferredDurations": [30, 60],
        "maxClips": 5
    });
    let (status, body) = call(
        &h.app,
        json_request(Method::POST, "/api/jobs", Some("u-1"), submit.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["job"]["providerJobId"], "p-1");
    assert_eq!(body["job"]["status"], "submitted");

    let requests = h.server.received_requests().await.unwrap();
    let create = requests
        .iter()
        .find(|r| r.method.to_string() == "POST")
        .unwrap();
    let sent: Value = serde_json::from_slice(&create.body).unwrap();
    assert_eq!(
        sent["sourceUrl"],
        "https://r2.test/uploads/u-1/s-1/abc/talk.mp4?sig=get"
    );
    assert_eq!(sent["maxClips"], 5);
    assert_eq!(sent["language"], "en");

    let (status, body) = call(
        &h.app,
        json_request(Method::POST, "/api/jobs", Some("u-1"), submit),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    h.jobs.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_foreign_storage_key() {
    let h = harness(None).await;
    let request = json_request(
        Method::POST,
        "/api/jobs",
        Some("u-1"),
        json!({ "sessionId": "s-1", "storageKey": "uploads/u-2/s-1/abc/talk.mp4" }),
    );
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.server.received_requests().await.unwrap().is_empty());
    assert!(h.store.get(&SessionId::from("s-1")).is_none());
}

#[tokio::test]
async fn test_submit_requires_a_source() {
    let h = harness(None).await;
    let request = json_request(
        Method::POST,
        "/api/jobs",
        Some("u-1"),
        json!({ "sessionId": "s-1" }),
    );
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("sourceUrl"));
}

#[tokio::test]
async fn test_unmatched_webhook_is_404_without_side_effects() {
    let h = harness(None).await;
    seed_bound_session(&h.store, "s-1", "u-1", "p-1");
    let before = h.store.get(&SessionId::from("s-1")).unwrap();

    let request = json_request(
        Method::POST,
        &webhook_uri(),
        None,
        json!({ "projectId": "ghost", "status": "completed", "clips": [{ "id": "x", "score": 9 }] }),
    );
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(h.store.get(&SessionId::from("s-1")).unwrap(), before);
}

#[tokio::test]
async fn test_repeated_webhook_is_idempotent() {
    let h = harness(None).await;
    seed_bound_session(&h.store, "s-1", "u-1", "p-1");
    let payload = json!({
        "projectId": "p-1",
        "status": "completed",
        "clips": [{ "id": "a", "score": 9 }, { "id": "b", "score": 7 }]
    });

    let (status, body) = call(
        &h.app,
        json_request(Method::POST, &webhook_uri(), None, payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "applied");
    assert_eq!(body["jobStatus"], "completed");
    assert_eq!(body["clipsAdded"], 2);

    let (status, body) = call(
        &h.app,
        json_request(Method::POST, &webhook_uri(), None, payload),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "duplicate");
    assert_eq!(body["clipsAdded"], 0);
    assert_eq!(body["totalClips"], 2);

    let stored = h.store.get(&SessionId::from("s-1")).unwrap();
    assert_eq!(stored.clips.len(), 2);
    assert_eq!(stored.job.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_signed_webhooks_when_secret_configured() {
    let h = harness(Some("whsec")).await;
    seed_bound_session(&h.store, "s-1", "u-1", "p-1");
    let payload = json!({ "projectId": "p-1", "status": "failed", "error": "unreadable" });

    let (status, _) = call(
        &h.app,
        json_request(Method::POST, &webhook_uri(), None, payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let job = h.store.get(&SessionId::from("s-1")).unwrap().job.unwrap();
    assert_eq!(job.status, JobStatus::Submitted);

    let body = payload.to_string();
    let request = Request::builder()
        .method(Method::POST)
        .uri(webhook_uri())
        .header(header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, sign("whsec", body.as_bytes()).unwrap())
        .body(Body::from(body))
        .unwrap();
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobStatus"], "failed");
}

#[tokio::test]
async fn test_session_job_is_owner_only() {
    let h = harness(None).await;
    seed_bound_session(&h.store, "s-1", "u-1", "p-1");

    let (status, body) = call(&h.app, get_request("/api/sessions/s-1/job", Some("u-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "s-1");
    assert_eq!(body["job"]["providerJobId"], "p-1");
    assert_eq!(body["clips"], json!([]));

    let (status, _) = call(&h.app, get_request("/api/sessions/s-1/job", Some("u-2"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, get_request("/api/sessions/s-1/job", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_manual_reconcile_recovers_orphaned_job() {
    let h = harness(None).await;
    h.store
        .insert(SessionRecord::new(SessionId::from("s-1"), "u-1"));
    Mock::given(method("GET"))
        .and(path("/project/query/p-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 2000,
            "videos": [{ "id": "a", "score": 9 }]
        })))
        .mount(&h.server)
        .await;

    let (status, body) = call(
        &h.app,
        json_request(
            Method::POST,
            "/api/jobs/reconcile",
            Some("u-1"),
            json!({ "providerJobId": "p-9" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("sessionId"));

    let (status, body) = call(
        &h.app,
        json_request(
            Method::POST,
            "/api/jobs/reconcile",
            Some("u-1"),
            json!({ "sessionId": "s-1", "providerJobId": "p-9" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobStatus"], "completed");
    assert_eq!(body["totalClips"], 1);

    h.jobs.shutdown().await;
}
