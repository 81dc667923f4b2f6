use std::sync::Arc;
use std::time::SystemTime;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::auth::SessionService;
use crate::config::Config;
use crate::email::RecordingEmailSender;
use crate::github::{IssueSummary, MockIssueTracker};
use crate::identity::MockIdentityProvider;
use crate::jobs::RecordingJobInvoker;
use crate::mailing_list::RecordingMailingList;
use crate::payments::{MockPaymentsProvider, WebhookVerifier, sign_webhook_payload};
use crate::social::MockSocialNetwork;
use crate::status_store::StatusStore;
use crate::storage::{MemoryObjectStore, ObjectStore};
use crate::workflow::{JobSubmissionStatus, WorkflowStore};

const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

struct TestHarness {
    router: Router,
    sessions: SessionService,
    identity: MockIdentityProvider,
    payments: MockPaymentsProvider,
    storage: MemoryObjectStore,
    jobs: RecordingJobInvoker,
    email: RecordingEmailSender,
    mailing_list: RecordingMailingList,
    issues: MockIssueTracker,
    social: MockSocialNetwork,
    workflows: WorkflowStore,
    statuses: StatusStore,
}

fn harness() -> TestHarness {
    let config = Config::for_tests();

    let identity = MockIdentityProvider::default();
    let payments = MockPaymentsProvider::default();
    let storage = MemoryObjectStore::default();
    let jobs = RecordingJobInvoker::default();
    let email = RecordingEmailSender::default();
    let mailing_list = RecordingMailingList::default();
    let issues = MockIssueTracker::default();
    let social = MockSocialNetwork::default();
    let workflows = WorkflowStore::from_config(&config);
    let statuses = StatusStore::from_config(&config);
    let webhook = WebhookVerifier::from_config(&config);
    let sessions = SessionService::new(
        Arc::new(identity.clone()),
        config.session_request_ttl_seconds,
    );

    let state = super::AppState {
        config: Arc::new(config),
        sessions: sessions.clone(),
        identity: Arc::new(identity.clone()),
        payments: Arc::new(payments.clone()),
        storage: Arc::new(storage.clone()),
        jobs: Arc::new(jobs.clone()),
        email: Arc::new(email.clone()),
        mailing_list: Arc::new(mailing_list.clone()),
        issues: Arc::new(issues.clone()),
        social: Arc::new(social.clone()),
        workflows: workflows.clone(),
        statuses: statuses.clone(),
        webhook,
        started_at: SystemTime::now(),
    };

    TestHarness {
        router: super::router(state),
        sessions,
        identity,
        payments,
        storage,
        jobs,
        email,
        mailing_list,
        issues,
        social,
        workflows,
        statuses,
    }
}

impl TestHarness {
    async fn signed_in_user(&self) -> (crate::identity::IdentityUser, String) {
        let user = self.identity.insert_user("dev@roamjs.test", "Dev User").await;
        let token = self.identity.issue_session(&user.id).await;
        (user, token)
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("request should complete");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();

    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    (status, value)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request builds")
}

fn get_authed(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request builds")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

fn post_json_authed(uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

fn put_json_authed(uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

#[tokio::test]
async fn health_reports_service_identity() {
    let harness = harness();
    let (status, body) = send(&harness.router, get_request("/healthz")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "roamjs-api-service");
    assert_eq!(body["identityProvider"], "mock");
}

#[tokio::test]
async fn responses_carry_permissive_cors_headers() {
    let harness = harness();
    let request = Request::builder()
        .method("GET")
        .uri("/healthz")
        .header(header::ORIGIN, "https://roamresearch.com")
        .body(Body::empty())
        .expect("request builds");

    let response = harness
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("request should complete");

    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn legacy_doc_urls_redirect_permanently() {
    let harness = harness();
    let response = harness
        .router
        .clone()
        .oneshot(get_request("/docs/extensions/query-builder"))
        .await
        .expect("request should complete");

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some("/extensions/query-builder")
    );
}

#[tokio::test]
async fn versions_rejects_non_positive_limit() {
    let harness = harness();
    let (status, body) = send(
        &harness.router,
        get_request("/api/versions?id=query-builder&limit=0"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Limit must be greater than 0");
}

#[tokio::test]
async fn versions_rejects_negative_page() {
    let harness = harness();
    let (status, body) = send(
        &harness.router,
        get_request("/api/versions?id=query-builder&page=-1"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Page must be greater than or equal to 0");
}

#[tokio::test]
async fn versions_for_unknown_extension_are_empty_and_ended() {
    let harness = harness();
    let (status, body) = send(&harness.router, get_request("/api/versions?id=missing")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["versions"], json!([]));
    assert_eq!(body["isEnd"], true);
}

#[tokio::test]
async fn versions_paginate_newest_first() {
    let harness = harness();
    for key in [
        "query-builder/2023-01-01T00:00:00/extension.js",
        "query-builder/2023-06-01T00:00:00/extension.js",
        "query-builder/2022-11-01T00:00:00/extension.js",
    ] {
        harness
            .storage
            .put_object(key, b"body".to_vec(), "text/javascript")
            .await
            .expect("seed object");
    }

    let (status, body) = send(
        &harness.router,
        get_request("/api/versions?id=query-builder&limit=2&page=0"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["versions"],
        json!(["2023-06-01T00:00:00", "2023-01-01T00:00:00"])
    );
    assert_eq!(body["isEnd"], false);

    let (_, body) = send(
        &harness.router,
        get_request("/api/versions?id=query-builder&limit=2&page=1"),
    )
    .await;
    assert_eq!(body["versions"], json!(["2022-11-01T00:00:00"]));
    assert_eq!(body["isEnd"], true);
}

#[tokio::test]
async fn service_start_without_session_is_rejected() {
    let harness = harness();
    let (status, body) = send(
        &harness.router,
        post_json("/api/service/start", &json!({ "service": "static-site" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "No Active Session");
}

#[tokio::test]
async fn service_start_with_payment_method_subscribes_directly() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;
    harness.payments.insert_price("static-site", 900).await;
    harness.payments.seed_customer(&user.email, true).await;

    let (status, body) = send(
        &harness.router,
        post_json_authed(
            "/api/service/start",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(harness.payments.subscription_count().await, 1);

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert_eq!(snapshot.public_string_list("services"), vec!["static-site"]);
    assert!(snapshot.private_str("payments_customer_id").is_some());
}

#[tokio::test]
async fn service_start_without_payment_method_redirects_to_checkout() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;
    harness.payments.insert_price("static-site", 900).await;

    let (status, body) = send(
        &harness.router,
        post_json_authed(
            "/api/service/start",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let session_id = body["sessionId"].as_str().expect("session id returned");
    assert!(session_id.starts_with("cs_test_"));
    assert_eq!(harness.payments.subscription_count().await, 0);
}

#[tokio::test]
async fn service_start_for_unpriced_service_is_rejected() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        post_json_authed(
            "/api/service/start",
            &token,
            &json!({ "service": "unknown-service" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "No price found for service unknown-service");
}

#[tokio::test]
async fn checkout_webhook_finishes_the_service_workflow() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;
    harness.payments.insert_price("static-site", 900).await;

    let (status, _) = send(
        &harness.router,
        post_json_authed(
            "/api/service/start",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let sessions = harness.payments.checkout_sessions().await;
    let callback_token = sessions[0]
        .metadata
        .iter()
        .find(|(key, _)| key == "callback_token")
        .map(|(_, value)| value.clone())
        .expect("checkout metadata carries the callback token");

    let event = json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": { "metadata": {
            "user_id": user.id,
            "service": "static-site",
            "callback_token": callback_token,
        } } },
    })
    .to_string();
    let signature = sign_webhook_payload(
        TEST_WEBHOOK_SECRET,
        Utc::now().timestamp(),
        event.as_bytes(),
    );

    let request = Request::builder()
        .method("POST")
        .uri("/api/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", signature.clone())
        .body(Body::from(event.clone()))
        .expect("request builds");
    let (status, body) = send(&harness.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert_eq!(snapshot.public_string_list("services"), vec!["static-site"]);

    // The callback token was consumed; replaying the event is rejected.
    let replay = Request::builder()
        .method("POST")
        .uri("/api/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", signature)
        .body(Body::from(event))
        .expect("request builds");
    let (status, _) = send(&harness.router, replay).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    let harness = harness();
    let event = json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": {} },
    })
    .to_string();
    let signature = sign_webhook_payload("wrong-secret", Utc::now().timestamp(), event.as_bytes());

    let request = Request::builder()
        .method("POST")
        .uri("/api/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", signature)
        .body(Body::from(event))
        .expect("request builds");
    let (status, body) = send(&harness.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized");
}

#[tokio::test]
async fn service_finish_with_wrong_token_changes_nothing() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;
    harness.payments.insert_price("static-site", 900).await;

    send(
        &harness.router,
        post_json_authed(
            "/api/service/start",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;

    let (status, body) = send(
        &harness.router,
        post_json(
            "/api/service/finish",
            &json!({
                "userId": user.id,
                "service": "static-site",
                "callbackToken": "cb_not_the_token",
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized");

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert!(snapshot.public_string_list("services").is_empty());
}

#[tokio::test]
async fn service_end_cancels_once_then_conflicts() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;
    harness.payments.insert_price("static-site", 900).await;
    harness.payments.seed_customer(&user.email, true).await;

    send(
        &harness.router,
        post_json_authed(
            "/api/service/start",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;

    let (status, body) = send(
        &harness.router,
        post_json_authed(
            "/api/service/end",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert!(snapshot.public_string_list("services").is_empty());

    let (status, body) = send(
        &harness.router,
        post_json_authed(
            "/api/service/end",
            &token,
            &json!({ "service": "static-site" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "Service is not enabled.");
}

#[tokio::test]
async fn path_reservation_rejects_taken_paths() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;
    harness
        .storage
        .put_object("developer/index", Vec::new(), "text/plain")
        .await
        .expect("seed reservation");

    let (status, body) = send(
        &harness.router,
        post_json_authed("/api/publish", &token, &json!({ "path": "developer" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Requested path is not available");
}

#[tokio::test]
async fn path_reservation_persists_placeholder_and_metadata() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        post_json_authed("/api/publish", &token, &json!({ "path": "roam-tools" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "roam-tools");

    let placeholder = harness
        .storage
        .get_object("roam-tools/index")
        .await
        .expect("storage reachable");
    assert!(placeholder.is_some());

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert_eq!(snapshot.public_string_list("paths"), vec!["roam-tools"]);
}

#[tokio::test]
async fn markdown_publishing_requires_a_reserved_path() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        put_json_authed(
            "/api/publish",
            &token,
            &json!({ "path": "not-mine", "content": "# Docs" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Path is not reserved by this user.");

    send(
        &harness.router,
        post_json_authed("/api/publish", &token, &json!({ "path": "roam-tools" })),
    )
    .await;

    let (status, body) = send(
        &harness.router,
        put_json_authed(
            "/api/publish",
            &token,
            &json!({ "path": "roam-tools/guide", "content": "# Docs" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["key"], "markdown/roam-tools/guide.md");

    let stored = harness
        .storage
        .get_object("markdown/roam-tools/guide.md")
        .await
        .expect("storage reachable")
        .expect("markdown stored");
    assert_eq!(stored, b"# Docs");
}

#[tokio::test]
async fn website_launch_records_status_and_fires_the_job() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        post_json_authed(
            "/api/website/launch",
            &token,
            &json!({ "graph": "dev-graph", "domain": "Dev.RoamJS.com" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let invocations = harness.jobs.invocations().await;
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].job_name, "launch-website");
    assert_eq!(invocations[0].payload["graph"], "dev-graph");
    assert_eq!(invocations[0].payload["domain"], "dev.roamjs.com");
    assert_eq!(invocations[0].payload["userId"], user.id.as_str());
    assert!(
        invocations[0].payload["callbackToken"]
            .as_str()
            .is_some_and(|value| value.starts_with("cb_"))
    );

    let latest = harness
        .statuses
        .latest("launch", "dev-graph")
        .await
        .expect("status recorded");
    assert_eq!(latest.status, "INITIALIZING");
}

#[tokio::test]
async fn website_completion_with_wrong_token_mutates_nothing() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;

    send(
        &harness.router,
        post_json_authed(
            "/api/website/launch",
            &token,
            &json!({ "graph": "dev-graph", "domain": "dev.roamjs.com" }),
        ),
    )
    .await;

    let (status, body) = send(
        &harness.router,
        post_json(
            "/api/website/complete",
            &json!({
                "userId": user.id,
                "graph": "dev-graph",
                "operation": "launch",
                "callbackToken": "cb_forged",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unauthorized");

    let latest = harness
        .statuses
        .latest("launch", "dev-graph")
        .await
        .expect("status recorded");
    assert_eq!(latest.status, "INITIALIZING");

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert!(!snapshot.public_metadata.contains_key("website"));
}

#[tokio::test]
async fn website_launch_completes_end_to_end() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;

    send(
        &harness.router,
        post_json_authed(
            "/api/website/launch",
            &token,
            &json!({ "graph": "dev-graph", "domain": "dev.roamjs.com" }),
        ),
    )
    .await;

    let invocations = harness.jobs.invocations().await;
    let payload = &invocations[0].payload;
    let callback_token = payload["callbackToken"].as_str().expect("token in payload");
    let submission_id = payload["submissionId"].as_str().expect("submission id");

    let (status, body) = send(
        &harness.router,
        post_json(
            "/api/website/complete",
            &json!({
                "userId": user.id,
                "graph": "dev-graph",
                "operation": "launch",
                "callbackToken": callback_token,
                "domain": "dev.roamjs.com",
                "submissionId": submission_id,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert_eq!(snapshot.public_metadata["website"]["graph"], "dev-graph");
    assert_eq!(snapshot.public_metadata["website"]["status"], "LIVE");

    let latest = harness
        .statuses
        .latest("launch", "dev-graph")
        .await
        .expect("status recorded");
    assert_eq!(latest.status, "LIVE");

    let submission = harness
        .workflows
        .submission(submission_id)
        .await
        .expect("submission recorded");
    assert_eq!(submission.status, JobSubmissionStatus::Completed);

    // The callback token is single-use.
    let (status, _) = send(
        &harness.router,
        post_json(
            "/api/website/complete",
            &json!({
                "userId": user.id,
                "graph": "dev-graph",
                "operation": "launch",
                "callbackToken": callback_token,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn website_status_returns_the_latest_record() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    harness
        .statuses
        .append("launch", "dev-graph", None, "INITIALIZING")
        .await
        .expect("append");
    harness
        .statuses
        .append("launch", "dev-graph", None, "CREATING RESOURCES")
        .await
        .expect("append");

    let (status, body) = send(
        &harness.router,
        get_authed("/api/website/status?graph=dev-graph", &token),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CREATING RESOURCES");
    assert_eq!(body["action"], "launch");
}

#[tokio::test]
async fn website_status_requires_a_graph() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    let (status, body) = send(&harness.router, get_authed("/api/website/status", &token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "A graph is required.");
}

#[tokio::test]
async fn expired_session_requests_are_absent_and_lookups_stay_clean() {
    let harness = harness();

    let (status, body) = send(
        &harness.router,
        post_json("/api/auth/session", &json!({ "email": "dev@roamjs.test" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let request_id = body["requestId"].as_str().expect("request id").to_string();

    harness.sessions.force_expire_session_request(&request_id).await;

    let (status, _) = send(
        &harness.router,
        get_request(&format!("/api/auth/session/{request_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Deletion on lookup is idempotent; asking again looks identical.
    let (status, _) = send(
        &harness.router,
        get_request(&format!("/api/auth/session/{request_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_request_round_trip_delivers_the_token() {
    let harness = harness();

    let (_, body) = send(
        &harness.router,
        post_json("/api/auth/session", &json!({ "email": "dev@roamjs.test" })),
    )
    .await;
    let request_id = body["requestId"].as_str().expect("request id").to_string();

    let (status, _) = send(
        &harness.router,
        post_json(
            &format!("/api/auth/session/{request_id}"),
            &json!({ "sessionToken": "sess_fresh" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &harness.router,
        get_request(&format!("/api/auth/session/{request_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionToken"], "sess_fresh");
}

#[tokio::test]
async fn account_creation_subscribes_and_welcomes_once() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;

    let post_user = || {
        Request::builder()
            .method("POST")
            .uri("/api/user")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request builds")
    };

    let (status, body) = send(&harness.router, post_user()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = send(&harness.router, post_user()).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(harness.mailing_list.subscribed().await, vec![user.email.clone()]);
    let sent = harness.email.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, user.email);
}

#[tokio::test]
async fn sponsorship_charges_through_the_payments_provider() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        post_json_authed("/api/sponsor", &token, &json!({ "value": 2500 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(harness.payments.charge_count().await, 1);

    let (status, body) = send(
        &harness.router,
        post_json_authed("/api/sponsor", &token, &json!({ "value": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Sponsorship value must be greater than 0");
}

#[tokio::test]
async fn github_issue_listing_passes_through() {
    let harness = harness();
    harness
        .issues
        .insert_issues(
            "dvargas92495/roamjs-query-builder",
            vec![IssueSummary {
                number: 42,
                title: "Support nested queries".to_string(),
                state: "open".to_string(),
                html_url: None,
            }],
        )
        .await;

    let (status, body) = send(
        &harness.router,
        get_request("/api/github/issues?repo=dvargas92495/roamjs-query-builder"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issues"][0]["number"], 42);
    assert_eq!(body["issues"][0]["title"], "Support nested queries");
}

#[tokio::test]
async fn social_auth_stores_credentials_then_search_uses_them() {
    let harness = harness();
    let (user, token) = harness.signed_in_user().await;
    harness.social.seed_code("auth_code_1").await;
    harness
        .social
        .seed_search_result("roamjs", json!({ "data": [{ "id": "1", "text": "roamjs" }] }))
        .await;

    let (status, _) = send(
        &harness.router,
        post_json_authed("/api/social/auth", &token, &json!({ "code": "auth_code_1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let snapshot = harness
        .identity
        .user_snapshot(&user.id)
        .await
        .expect("user exists");
    assert!(
        snapshot.private_metadata["social_oauth"]["access_token"]
            .as_str()
            .is_some()
    );

    let (status, body) = send(
        &harness.router,
        get_authed("/api/social/search?query=roamjs", &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["text"], "roamjs");
}

#[tokio::test]
async fn social_search_without_connected_account_is_rejected() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        get_authed("/api/social/search?query=roamjs", &token),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Social account is not connected.");
}

#[tokio::test]
async fn invalid_social_auth_code_is_unauthorized() {
    let harness = harness();
    let (_user, token) = harness.signed_in_user().await;

    let (status, body) = send(
        &harness.router,
        post_json_authed("/api/social/auth", &token, &json!({ "code": "bogus" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "That authorization code is invalid or expired.");
}
