//! Integration tests for the HTTP surface
//!
//! Drives the router with `oneshot` against a temporary database. No
//! worker runs here, so queued jobs stay pending.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt; // for `oneshot`

use podcast_adstrip::api::{build_router, AppState};
use podcast_adstrip::auth::{AuthFailureLimiter, Authorizer, IssuedToken};
use podcast_adstrip::config::AuthConfig;
use podcast_adstrip::database::{
    CreateJobOutcome, CutStrategy, Database, JobStatus, ProcessingStatistics, TokenScope,
    TriggerSource,
};
use podcast_adstrip::trigger::{JobDispatcher, TriggerEngine, TriggerPolicy};

const ADMIN_KEY: &str = "admin-test-key";

struct TestApp {
    dir: TempDir,
    db: Arc<Database>,
    state: AppState,
    wake_rx: mpsc::Receiver<String>,
    episode_id: i64,
    feed_token: IssuedToken,
    combined_token: IssuedToken,
}

impl TestApp {
    fn new() -> Self {
        Self::with_admin_key(Some(ADMIN_KEY))
    }

    fn with_admin_key(admin_key: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
        let feed_id = db.insert_feed("Pod", false).unwrap();
        let episode_id = db
            .insert_episode("ep-1", feed_id, "Episode 1", "http://example.invalid/ep-1.mp3")
            .unwrap();

        let authorizer = Arc::new(Authorizer::new(db.clone()));
        let feed_token = authorizer
            .issue_token(7, TokenScope::FeedScoped(feed_id))
            .unwrap();
        let combined_token = authorizer.issue_token(7, TokenScope::Combined).unwrap();

        let (dispatcher, wake_rx) = JobDispatcher::channel(16);
        let state = AppState {
            db: db.clone(),
            engine: Arc::new(TriggerEngine::new(
                db.clone(),
                TriggerPolicy::default(),
                dispatcher,
            )),
            authorizer,
            limiter: Arc::new(AuthFailureLimiter::new(&AuthConfig::default())),
            admin_key: admin_key.map(str::to_string),
        };

        Self {
            dir,
            db,
            state,
            wake_rx,
            episode_id,
            feed_token,
            combined_token,
        }
    }

    async fn send(&self, request: Request<Body>) -> axum::response::Response {
        build_router(self.state.clone()).oneshot(request).await.unwrap()
    }

    fn creds(token: &IssuedToken) -> String {
        format!("feed_token={}&feed_secret={}", token.token_id, token.secret)
    }

    fn jobs(&self) -> i64 {
        self.db.count_jobs_for_episode(self.episode_id).unwrap()
    }

    /// Give the episode a processed file on disk.
    fn complete_with_artifact(&self, bytes: &[u8]) {
        let path = self.dir.path().join("ep-1-processed.mp3");
        std::fs::write(&path, bytes).unwrap();

        let job = match self
            .db
            .try_create_job(self.episode_id, TriggerSource::Manual, None, Utc::now(), None)
            .unwrap()
        {
            CreateJobOutcome::Created(job) => job,
            other => panic!("unexpected {:?}", other),
        };
        self.db.claim_next_pending_job(Utc::now()).unwrap().unwrap();
        let stats = ProcessingStatistics {
            episode_id: self.episode_id,
            job_id: job.id.clone(),
            intervals_removed: 0,
            seconds_removed: 0.0,
            original_duration: 10.0,
            processed_duration: 10.0,
            percentage_removed: 0.0,
            strategy: CutStrategy::Passthrough,
            ad_classification_count: 0,
            preset_id: None,
        };
        assert!(self
            .db
            .complete_job(&job.id, &path.to_string_lossy(), &stats, Utc::now())
            .unwrap());
    }
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

fn header_str<'a>(response: &'a axum::response::Response, name: header::HeaderName) -> &'a str {
    response
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap())
        .unwrap_or_default()
}

// =============================================================================
// Download decisions
// =============================================================================

#[tokio::test]
async fn test_head_probe_never_creates_work() {
    let app = TestApp::new();
    let creds = TestApp::creds(&app.feed_token);

    for uri in [
        format!("/api/posts/ep-1/download?{}", creds),
        format!("/post/ep-1.mp3?{}", creds),
        "/api/posts/ep-1/download".to_string(),
    ] {
        let response = app.send(request("HEAD", &uri)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT, "{}", uri);
    }
    assert_eq!(app.jobs(), 0);
}

#[tokio::test]
async fn test_head_requests_ignore_credentials() {
    let app = TestApp::new();
    let bad = format!(
        "/api/posts/ep-1/download?feed_token={}&feed_secret=guess",
        app.feed_token.token_id
    );

    // Well past the free failure allowance
    for _ in 0..10 {
        let response = app.send(request("HEAD", &bad)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    let good = format!("/api/posts/ep-1/download?{}", TestApp::creds(&app.feed_token));
    let response = app.send(request("HEAD", &good)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let token = app.db.get_token(&app.feed_token.token_id).unwrap().unwrap();
    assert!(token.last_used_at.is_none());

    // Not locked out: the real fetch goes through
    let response = app.send(request("GET", &good)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(app.jobs(), 1);
}

#[tokio::test]
async fn test_feed_scoped_fetch_queues_one_job() {
    let mut app = TestApp::new();
    let uri = format!("/api/posts/ep-1/download?{}", TestApp::creds(&app.feed_token));

    let response = app.send(request("GET", &uri)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, header::RETRY_AFTER), "60");
    assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-store");
    let body = json_body(response).await;
    assert_eq!(body["state"], "queued");
    assert_eq!(body["retry_after_seconds"], 60);

    let job = app.db.get_active_job(app.episode_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.trigger_source, TriggerSource::OnDemandRequest);
    assert_eq!(job.triggered_by, Some(7));
    assert_eq!(app.wake_rx.try_recv().unwrap(), job.id);

    // Second fetch sees the active job
    let response = app.send(request("GET", &uri)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, header::RETRY_AFTER), "120");
    assert_eq!(json_body(response).await["state"], "processing");
    assert_eq!(app.jobs(), 1);
}

#[tokio::test]
async fn test_cooldown_after_failed_job() {
    let app = TestApp::new();
    let uri = format!("/api/posts/ep-1/download?{}", TestApp::creds(&app.feed_token));

    app.send(request("GET", &uri)).await;
    let job = app.db.get_active_job(app.episode_id).unwrap().unwrap();
    app.db.fail_job(&job.id, "transcribing: boom", Utc::now()).unwrap();

    let response = app.send(request("GET", &uri)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let retry: u64 = header_str(&response, header::RETRY_AFTER).parse().unwrap();
    assert!(retry > 590 && retry <= 600, "retry {}", retry);
    assert_eq!(json_body(response).await["state"], "cooldown");
    assert_eq!(app.jobs(), 1);
}

#[tokio::test]
async fn test_combined_token_is_read_only() {
    let app = TestApp::new();
    let uri = format!(
        "/api/posts/ep-1/download?{}",
        TestApp::creds(&app.combined_token)
    );

    let response = app.send(request("GET", &uri)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, header::RETRY_AFTER), "1800");
    assert_eq!(json_body(response).await["state"], "not_ready");
    assert_eq!(app.jobs(), 0);
}

#[tokio::test]
async fn test_bad_or_missing_credentials_are_unauthorized() {
    let app = TestApp::new();

    let bad = format!(
        "/api/posts/ep-1/download?feed_token={}&feed_secret=wrong",
        app.feed_token.token_id
    );
    let response = app.send(request("GET", &bad)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::RETRY_AFTER).is_none());
    assert_eq!(json_body(response).await["state"], "unauthorized");

    let response = app.send(request("GET", "/api/posts/ep-1/download")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.jobs(), 0);
}

#[tokio::test]
async fn test_unknown_episode_is_not_found() {
    let app = TestApp::new();
    let creds = TestApp::creds(&app.feed_token);

    let response = app
        .send(request("GET", &format!("/api/posts/nope/download?{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .send(request("HEAD", &format!("/post/nope.mp3?{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.send(request("GET", "/post/ep-1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_legacy_route_triggers_like_download_route() {
    let app = TestApp::new();
    let uri = format!("/post/ep-1.mp3?{}", TestApp::creds(&app.feed_token));

    let response = app.send(request("GET", &uri)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["state"], "queued");
    assert_eq!(app.jobs(), 1);
}

#[tokio::test]
async fn test_processed_artifact_is_served_with_ranges() {
    let app = TestApp::new();
    app.complete_with_artifact(b"0123456789");

    // No credentials needed once the file exists
    let response = app.send(request("GET", "/api/posts/ep-1/download")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "audio/mpeg");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"0123456789");

    let ranged = Request::builder()
        .method("GET")
        .uri("/post/ep-1.mp3")
        .header(header::RANGE, "bytes=2-5")
        .body(Body::empty())
        .unwrap();
    let response = app.send(ranged).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"2345");

    // HEAD is still only a probe
    let response = app.send(request("HEAD", "/api/posts/ep-1/download")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let status = format!("/api/trigger/status?guid=ep-1&{}", TestApp::creds(&app.feed_token));
    let body = json_body(app.send(request("GET", &status)).await).await;
    assert_eq!(body["state"], "ready");
    assert_eq!(body["statistics"]["strategy"], "passthrough");
}

#[tokio::test]
async fn test_repeated_bad_secrets_lock_the_client_out() {
    let app = TestApp::new();
    let bad = format!(
        "/api/posts/ep-1/download?feed_token={}&feed_secret=guess",
        app.feed_token.token_id
    );

    for _ in 0..5 {
        let response = app.send(request("GET", &bad)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
    let response = app.send(request("GET", &bad)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&response, header::RETRY_AFTER), "2");
    let body = json_body(response).await;
    assert_eq!(body["state"], "unauthorized");
    assert_eq!(body["retry_after_seconds"], 2);

    // Even the right secret is refused during the lockout
    let creds = TestApp::creds(&app.feed_token);
    let good = format!("/api/posts/ep-1/download?{}", creds);
    let response = app.send(request("GET", &good)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());

    for uri in [
        format!("/api/trigger/status?guid=ep-1&{}", creds),
        format!("/api/posts/ep-1/download/original?{}", creds),
    ] {
        let response = app.send(request("GET", &uri)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS, "{}", uri);
        assert!(response.headers().get(header::RETRY_AFTER).is_some());
    }
    let response = app
        .send(request("POST", &format!("/api/posts/ep-1/process?{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(app.jobs(), 0);
}

#[tokio::test]
async fn test_original_audio_requires_read_access() {
    let app = TestApp::new();
    let uri = |token: &IssuedToken| {
        format!("/api/posts/ep-1/download/original?{}", TestApp::creds(token))
    };

    // Not downloaded yet
    let response = app.send(request("GET", &uri(&app.feed_token))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let source = app.dir.path().join("ep-1-source.mp3");
    std::fs::write(&source, b"original-bytes").unwrap();
    app.db
        .mark_source_downloaded(app.episode_id, &source.to_string_lossy())
        .unwrap();

    let response = app.send(request("GET", "/api/posts/ep-1/download/original")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let other_feed = app.db.insert_feed("Other", false).unwrap();
    let stranger = app
        .state
        .authorizer
        .issue_token(8, TokenScope::FeedScoped(other_feed))
        .unwrap();
    let response = app.send(request("GET", &uri(&stranger))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    for token in [&app.feed_token, &app.combined_token] {
        let response = app.send(request("GET", &uri(token))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"original-bytes");
    }

    let response = app
        .send(request("GET", "/api/posts/nope/download/original"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    // Reading the original never queues processing
    assert_eq!(app.jobs(), 0);
}

// =============================================================================
// Status and explicit requests
// =============================================================================

#[tokio::test]
async fn test_status_endpoint_is_read_only() {
    let app = TestApp::new();
    let creds = TestApp::creds(&app.feed_token);

    let response = app.send(request("GET", "/api/trigger/status")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-store");
    let body = json_body(response).await;
    assert_eq!(body["state"], "error");
    assert_eq!(body["message"], "guid is required");

    let response = app
        .send(request("GET", &format!("/api/trigger/status?guid=ep-1&{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-store");
    let body = json_body(response).await;
    assert_eq!(body["state"], "not_started");
    assert_eq!(body["processed"], false);
    assert_eq!(app.jobs(), 0);

    let response = app
        .send(request("GET", "/api/trigger/status?guid=ep-1"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-store");
    let body = json_body(response).await;
    assert_eq!(body["state"], "error");
    assert!(body["message"].as_str().unwrap().contains("feed token"));

    let response = app
        .send(request("GET", &format!("/api/trigger/status?guid=missing&{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header_str(&response, header::CACHE_CONTROL), "no-store");
    assert_eq!(json_body(response).await["state"], "not_found");
}

#[tokio::test]
async fn test_manual_and_reprocess_requests() {
    let app = TestApp::new();
    let creds = TestApp::creds(&app.feed_token);

    let response = app
        .send(request("POST", &format!("/api/posts/ep-1/process?{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["trigger_source"], "manual");
    let first = body["job_id"].as_str().unwrap().to_string();

    let response = app
        .send(request("POST", &format!("/api/posts/ep-1/process?{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["job_id"], first.as_str());

    let response = app
        .send(request("POST", &format!("/api/posts/ep-1/reprocess?{}", creds)))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["trigger_source"], "reprocess");
    assert_eq!(body["cancelled_jobs"], 1);

    assert_eq!(
        app.db.get_job(&first).unwrap().unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(app.jobs(), 2);

    let combined = TestApp::creds(&app.combined_token);
    let response = app
        .send(request("POST", &format!("/api/posts/ep-1/reprocess?{}", combined)))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// =============================================================================
// Admin and health
// =============================================================================

#[tokio::test]
async fn test_admin_routes_require_key() {
    let app = TestApp::new();
    let creds = TestApp::creds(&app.feed_token);
    app.send(request("GET", &format!("/api/posts/ep-1/download?{}", creds)))
        .await;
    let job = app.db.get_active_job(app.episode_id).unwrap().unwrap();

    let response = app.send(request("GET", "/api/jobs/active")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let listed = Request::builder()
        .uri("/api/jobs/active")
        .header("X-Admin-Key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.send(listed).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], job.id.as_str());

    let cancel = || {
        Request::builder()
            .method("POST")
            .uri(format!("/api/jobs/{}/cancel", job.id))
            .header("X-Admin-Key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.send(cancel()).await.status(), StatusCode::OK);
    assert_eq!(app.send(cancel()).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_history_includes_terminal_jobs() {
    let app = TestApp::new();
    let creds = TestApp::creds(&app.feed_token);
    app.send(request("GET", &format!("/api/posts/ep-1/download?{}", creds)))
        .await;
    let job = app.db.get_active_job(app.episode_id).unwrap().unwrap();
    app.db.claim_next_pending_job(Utc::now()).unwrap().unwrap();
    assert!(app
        .db
        .fail_job(&job.id, "downloading: HTTP 404", Utc::now())
        .unwrap());

    let history = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header("X-Admin-Key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.send(request("GET", "/api/jobs")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(history("/api/jobs?status=failed&limit=10")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], job.id.as_str());
    assert_eq!(body[0]["status"], "failed");
    assert_eq!(body[0]["error_message"], "downloading: HTTP 404");

    let response = app.send(history("/api/jobs?status=completed")).await;
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 0);

    // The active view no longer shows it
    let response = app.send(history("/api/jobs/active")).await;
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 0);

    let response = app.send(history("/api/jobs?status=exploded")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_routes_hidden_without_key() {
    let app = TestApp::with_admin_key(None);
    let listed = Request::builder()
        .uri("/api/jobs/active")
        .header("X-Admin-Key", "anything")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(listed).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_endpoint_no_auth_required() {
    let app = TestApp::new();
    let response = app.send(request("GET", "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "podcast-adstrip");
    assert_eq!(body["active_jobs"], 0);
}
