use std::sync::Arc;
use std::time::SystemTime;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod auth;
pub mod config;
pub mod edge;
pub mod email;
pub mod github;
pub mod identity;
pub mod jobs;
pub mod mailing_list;
pub mod payments;
pub mod social;
pub mod status_store;
pub mod storage;
pub mod workflow;

use crate::api_envelope::{
    ApiErrorTuple, conflict_error, forbidden_error, internal_error, not_found_error,
    unauthorized_error, upstream_error, validation_error,
};
use crate::auth::{AuthError, SessionService};
use crate::config::Config;
use crate::email::{EmailSender, report_operator_error};
use crate::github::{IssueTracker, IssueTrackerError};
use crate::identity::{IdentityError, IdentityProvider, IdentityUser};
use crate::jobs::JobInvoker;
use crate::mailing_list::{MailingList, MailingListError};
use crate::payments::{
    PaymentsError, PaymentsProvider, WebhookError, WebhookEvent, WebhookVerifier,
};
use crate::social::{SocialError, SocialNetwork};
use crate::status_store::StatusStore;
use crate::storage::{
    ObjectStore, StorageError, list_extension_versions, markdown_key, reservation_key,
};
use crate::workflow::{WorkflowError, WorkflowKind, WorkflowStore};

const SERVICE_NAME: &str = "roamjs-api-service";
const PAYMENTS_SIGNATURE_HEADER: &str = "stripe-signature";
const DEFAULT_VERSIONS_LIMIT: i64 = 10;
const SERVICES_METADATA_KEY: &str = "services";
const PATHS_METADATA_KEY: &str = "paths";
const WEBSITE_METADATA_KEY: &str = "website";
const CUSTOMER_METADATA_KEY: &str = "payments_customer_id";
const SOCIAL_METADATA_KEY: &str = "social_oauth";
const WELCOMED_METADATA_KEY: &str = "welcomed";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    sessions: SessionService,
    identity: Arc<dyn IdentityProvider>,
    payments: Arc<dyn PaymentsProvider>,
    storage: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobInvoker>,
    email: Arc<dyn EmailSender>,
    mailing_list: Arc<dyn MailingList>,
    issues: Arc<dyn IssueTracker>,
    social: Arc<dyn SocialNetwork>,
    workflows: WorkflowStore,
    statuses: StatusStore,
    webhook: WebhookVerifier,
    started_at: SystemTime,
}

impl AppState {
    fn from_config(config: Config) -> Self {
        let identity = identity::provider_from_config(&config);
        let sessions = SessionService::new(identity.clone(), config.session_request_ttl_seconds);
        let payments = payments::provider_from_config(&config);
        let storage = storage::store_from_config(&config);
        let jobs = jobs::invoker_from_config(&config);
        let email = email::sender_from_config(&config);
        let mailing_list = mailing_list::list_from_config(&config);
        let issues = github::tracker_from_config(&config);
        let social = social::network_from_config(&config);
        let workflows = WorkflowStore::from_config(&config);
        let statuses = StatusStore::from_config(&config);
        let webhook = WebhookVerifier::from_config(&config);

        Self {
            config: Arc::new(config),
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
            webhook,
            started_at: SystemTime::now(),
        }
    }
}

pub fn build_router(config: Config) -> Router {
    router(AppState::from_config(config))
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/api/auth/session", post(create_session_request))
        .route(
            "/api/auth/session/:request_id",
            get(get_session_request).post(attach_session_token),
        )
        .route("/api/user", get(current_user).post(finish_account_creation))
        .route("/api/user/status", get(user_status))
        .route("/api/versions", get(versions))
        .route("/api/publish", post(reserve_path).put(publish_markdown))
        .route("/api/service/start", post(service_start))
        .route("/api/service/finish", post(service_finish))
        .route("/api/service/end", post(service_end))
        .route("/api/payments/webhook", post(payments_webhook))
        .route("/api/website/launch", post(website_launch))
        .route("/api/website/update", post(website_update))
        .route("/api/website/shutdown", post(website_shutdown))
        .route("/api/website/complete", post(website_complete))
        .route("/api/website/status", get(website_status))
        .route("/api/sponsor", post(sponsor))
        .route("/api/github/issues", get(github_issues))
        .route("/api/social/auth", post(social_auth))
        .route("/api/social/search", get(social_search))
        .with_state(state)
        .layer(middleware::from_fn(edge::edge_gate))
        .layer(cors)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

fn auth_error_response(error: AuthError) -> ApiErrorTuple {
    match error {
        AuthError::Validation { message } => validation_error(message),
        AuthError::Unauthorized { message } => unauthorized_error(message),
        AuthError::NotFound { message } => not_found_error(message),
        AuthError::Provider { message } => internal_error(message),
        AuthError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

fn identity_error_response(error: IdentityError) -> ApiErrorTuple {
    match error {
        IdentityError::Unauthorized { message } => unauthorized_error(message),
        IdentityError::NotFound { message } => not_found_error(message),
        IdentityError::Provider { message } => internal_error(message),
        IdentityError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

fn payments_error_response(error: PaymentsError) -> ApiErrorTuple {
    match error {
        PaymentsError::Validation { message } => validation_error(message),
        PaymentsError::Conflict { message } => conflict_error(message),
        PaymentsError::Provider { message } => internal_error(message),
        PaymentsError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

fn storage_error_response(error: StorageError) -> ApiErrorTuple {
    match error {
        StorageError::Validation { message } => validation_error(message),
        StorageError::Provider { message } => internal_error(message),
        StorageError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

fn workflow_error_response(state: &AppState, error: WorkflowError) -> ApiErrorTuple {
    match error {
        WorkflowError::Unauthorized { message } => unauthorized_error(message),
        WorkflowError::Persistence { message } => {
            internal_with_report(state, "workflow-store", message)
        }
    }
}

fn mailing_list_error_response(error: MailingListError) -> ApiErrorTuple {
    match error {
        MailingListError::Provider { message } => internal_error(message),
        MailingListError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

fn issue_tracker_error_response(error: IssueTrackerError) -> ApiErrorTuple {
    match error {
        IssueTrackerError::Validation { message } => validation_error(message),
        IssueTrackerError::Provider { message } => internal_error(message),
        IssueTrackerError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

fn social_error_response(error: SocialError) -> ApiErrorTuple {
    match error {
        SocialError::Validation { message } => validation_error(message),
        SocialError::Unauthorized { message } => unauthorized_error(message),
        SocialError::Provider { message } => internal_error(message),
        SocialError::Upstream { status, body } => upstream_error(Some(status), Some(body)),
    }
}

/// Unexpected server errors are logged and reported to the operator address
/// as a best-effort side channel; the caller only sees a generic 500.
fn internal_with_report(state: &AppState, context: &'static str, detail: String) -> ApiErrorTuple {
    tracing::error!(
        target: "roamjs.api",
        context,
        detail = %detail,
        "unexpected server error",
    );
    report_operator_error(
        state.email.clone(),
        state.config.operator_email.clone(),
        context,
        detail,
    );
    internal_error("Unexpected server error.")
}

fn metadata_patch(key: &str, value: Value) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(key.to_string(), value);
    patch
}

fn valid_graph(graph: &str) -> bool {
    !graph.is_empty()
        && graph
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
}

fn normalize_reservation_path(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed.len() > 64 {
        return None;
    }

    let valid = trimmed.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    });

    valid.then(|| trimmed.to_string())
}

fn user_owns_path(user: &IdentityUser, path: &str) -> bool {
    user.public_string_list(PATHS_METADATA_KEY)
        .iter()
        .any(|owned| owned == path || path.starts_with(&format!("{owned}/")))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime_seconds = state
        .started_at
        .elapsed()
        .map(|duration| duration.as_secs())
        .unwrap_or_default();

    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": uptime_seconds,
        "identityProvider": state.sessions.provider_name(),
    }))
}

async fn readiness(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "identityProvider": state.identity.name(),
        "paymentsProvider": state.payments.name(),
        "objectStore": state.storage.name(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequestBody {
    email: String,
}

async fn create_session_request(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequestBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let record = state
        .sessions
        .create_session_request(body.email)
        .await
        .map_err(auth_error_response)?;

    Ok(Json(json!({
        "requestId": record.request_id,
        "email": record.email,
        "expiresAt": record.expires_at,
    })))
}

async fn get_session_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let Some(record) = state.sessions.lookup_session_request(&request_id).await else {
        return Err(not_found_error("Session request not found."));
    };

    Ok(Json(json!({
        "requestId": record.request_id,
        "email": record.email,
        "sessionToken": record.session_token,
        "expiresAt": record.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
struct AttachSessionTokenBody {
    #[serde(alias = "sessionToken")]
    session_token: String,
}

async fn attach_session_token(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<AttachSessionTokenBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    state
        .sessions
        .attach_session_token(&request_id, body.session_token)
        .await
        .map_err(auth_error_response)?;

    Ok(Json(json!({ "success": true })))
}

async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    Ok(Json(json!({
        "id": user.id,
        "email": user.email,
        "name": user.name,
        "publicMetadata": Value::Object(user.public_metadata),
    })))
}

/// Account-creation finish: mailing-list subscription plus a welcome email,
/// recorded in private metadata once both external calls have succeeded.
/// Repeat calls after that are no-ops.
async fn finish_account_creation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    if user
        .private_metadata
        .get(WELCOMED_METADATA_KEY)
        .and_then(Value::as_bool)
        == Some(true)
    {
        return Ok(Json(json!({ "success": true })));
    }

    state
        .mailing_list
        .subscribe(&user.email)
        .await
        .map_err(mailing_list_error_response)?;

    // A failed welcome email is not rolled back; the retry subscribes again,
    // which the mailing list provider treats as idempotent.
    state
        .email
        .send(
            &user.email,
            "Welcome to RoamJS",
            "<p>Thanks for creating a RoamJS account. Browse the extension marketplace to get started.</p>",
        )
        .await
        .map_err(|error| match error {
            email::EmailError::Provider { message } => internal_error(message),
            email::EmailError::Upstream { status, body } => {
                upstream_error(Some(status), Some(body))
            }
        })?;

    state
        .identity
        .update_private_metadata(&user.id, metadata_patch(WELCOMED_METADATA_KEY, json!(true)))
        .await
        .map_err(identity_error_response)?;

    Ok(Json(json!({ "success": true })))
}

async fn user_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let records: Vec<Value> = state
        .statuses
        .for_user(&user.id)
        .await
        .into_iter()
        .map(|record| {
            json!({
                "action": record.action,
                "graph": record.graph,
                "status": record.status,
                "recordedAt": record.recorded_at,
            })
        })
        .collect();

    Ok(Json(json!({ "statuses": records })))
}

#[derive(Debug, Deserialize)]
struct VersionsQuery {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    page: Option<i64>,
}

async fn versions(
    State(state): State<AppState>,
    Query(query): Query<VersionsQuery>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let extension_id = query
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("Extension id is required"))?;

    let limit = query.limit.unwrap_or(DEFAULT_VERSIONS_LIMIT);
    if limit <= 0 {
        return Err(validation_error("Limit must be greater than 0"));
    }

    let page = query.page.unwrap_or(0);
    if page < 0 {
        return Err(validation_error("Page must be greater than or equal to 0"));
    }

    let all_versions = list_extension_versions(state.storage.as_ref(), extension_id)
        .await
        .map_err(storage_error_response)?;

    let total = all_versions.len();
    let start = page
        .checked_mul(limit)
        .and_then(|value| usize::try_from(value).ok())
        .unwrap_or(usize::MAX);
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);

    let page_versions: Vec<String> = all_versions.into_iter().skip(start).take(limit).collect();
    let is_end = start.saturating_add(limit) >= total;

    Ok(Json(json!({
        "versions": page_versions,
        "isEnd": is_end,
    })))
}

#[derive(Debug, Deserialize)]
struct ReservePathBody {
    path: String,
}

async fn reserve_path(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReservePathBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let Some(path) = normalize_reservation_path(&body.path) else {
        return Err(validation_error(format!("Invalid path: {}", body.path)));
    };

    let existing = state
        .storage
        .list_keys(&format!("{path}/"))
        .await
        .map_err(storage_error_response)?;
    if !existing.is_empty() {
        return Err(validation_error("Requested path is not available"));
    }

    state
        .storage
        .put_object(&reservation_key(&path), Vec::new(), "text/plain")
        .await
        .map_err(storage_error_response)?;

    // Storage placeholder first; the metadata claim is only recorded once
    // the placeholder write has succeeded.
    let mut paths = user.public_string_list(PATHS_METADATA_KEY);
    if !paths.iter().any(|owned| owned == &path) {
        paths.push(path.clone());
    }
    state
        .identity
        .update_public_metadata(&user.id, metadata_patch(PATHS_METADATA_KEY, json!(paths)))
        .await
        .map_err(identity_error_response)?;

    tracing::info!(
        target: "roamjs.publish",
        user_id = %user.id,
        path = %path,
        "path reserved",
    );

    Ok(Json(json!({ "path": path })))
}

#[derive(Debug, Deserialize)]
struct PublishMarkdownBody {
    path: String,
    content: String,
}

async fn publish_markdown(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PublishMarkdownBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let Some(path) = normalize_reservation_path(&body.path) else {
        return Err(validation_error(format!("Invalid path: {}", body.path)));
    };

    if !user_owns_path(&user, &path) {
        return Err(forbidden_error("Path is not reserved by this user."));
    }

    let key = markdown_key(&path);
    state
        .storage
        .put_object(&key, body.content.into_bytes(), "text/markdown")
        .await
        .map_err(storage_error_response)?;

    Ok(Json(json!({ "key": key })))
}

#[derive(Debug, Deserialize)]
struct ServiceStartBody {
    service: String,
    #[serde(default)]
    quantity: Option<u64>,
}

async fn service_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ServiceStartBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let service = body.service.trim().to_string();
    if service.is_empty() {
        return Err(validation_error("A service is required."));
    }

    let price = state
        .payments
        .price_for_service(&service)
        .await
        .map_err(payments_error_response)?
        .ok_or_else(|| validation_error(format!("No price found for service {service}")))?;

    let customer_id = ensure_payments_customer(&state, &user).await?;

    if state
        .payments
        .active_subscription(&customer_id, &price.id)
        .await
        .map_err(payments_error_response)?
        .is_some()
    {
        return Err(conflict_error("Service is already enabled."));
    }

    let has_payment_method = state
        .payments
        .has_default_payment_method(&customer_id)
        .await
        .map_err(payments_error_response)?;

    if has_payment_method {
        state
            .payments
            .create_subscription(
                &customer_id,
                &price.id,
                &[
                    ("user_id".to_string(), user.id.clone()),
                    ("service".to_string(), service.clone()),
                ],
            )
            .await
            .map_err(payments_error_response)?;

        enable_service_for_user(&state, &user.id, &service).await?;

        return Ok(Json(json!({ "success": true })));
    }

    // No payment method on file: hand the caller a hosted checkout session
    // and finish through the checkout webhook's callback token.
    let started = state
        .workflows
        .begin(WorkflowKind::ServiceStart, &user.id, None)
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    let checkout = state
        .payments
        .create_checkout_session(
            &customer_id,
            &price.id,
            body.quantity.unwrap_or(1).max(1),
            &state.config.checkout_success_url,
            &state.config.checkout_cancel_url,
            &[
                ("user_id".to_string(), user.id.clone()),
                ("service".to_string(), service.clone()),
                ("callback_token".to_string(), started.callback_token.clone()),
            ],
        )
        .await
        .map_err(payments_error_response)?;

    Ok(Json(json!({ "sessionId": checkout.session_id })))
}

async fn ensure_payments_customer(
    state: &AppState,
    user: &IdentityUser,
) -> Result<String, ApiErrorTuple> {
    if let Some(existing) = user.private_str(CUSTOMER_METADATA_KEY) {
        return Ok(existing.to_string());
    }

    let customer_id = state
        .payments
        .ensure_customer(&user.email)
        .await
        .map_err(payments_error_response)?;

    // Linkage is written only after the provider confirmed the customer.
    state
        .identity
        .update_private_metadata(
            &user.id,
            metadata_patch(CUSTOMER_METADATA_KEY, json!(customer_id)),
        )
        .await
        .map_err(identity_error_response)?;

    Ok(customer_id)
}

async fn enable_service_for_user(
    state: &AppState,
    user_id: &str,
    service: &str,
) -> Result<(), ApiErrorTuple> {
    let user = state
        .identity
        .user_by_id(user_id)
        .await
        .map_err(identity_error_response)?;

    let mut services = user.public_string_list(SERVICES_METADATA_KEY);
    if !services.iter().any(|enabled| enabled == service) {
        services.push(service.to_string());
    }

    state
        .identity
        .update_public_metadata(
            user_id,
            metadata_patch(SERVICES_METADATA_KEY, json!(services)),
        )
        .await
        .map_err(identity_error_response)?;

    tracing::info!(
        target: "roamjs.payments",
        user_id,
        service,
        "service enabled",
    );

    Ok(())
}

#[derive(Debug, Deserialize)]
struct ServiceFinishBody {
    #[serde(alias = "userId")]
    user_id: String,
    service: String,
    #[serde(alias = "callbackToken")]
    callback_token: String,
}

async fn service_finish(
    State(state): State<AppState>,
    Json(body): Json<ServiceFinishBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    finish_service_start(&state, &body.user_id, &body.service, &body.callback_token).await?;
    Ok(Json(json!({ "success": true })))
}

async fn finish_service_start(
    state: &AppState,
    user_id: &str,
    service: &str,
    callback_token: &str,
) -> Result<(), ApiErrorTuple> {
    state
        .workflows
        .complete(WorkflowKind::ServiceStart, user_id, callback_token)
        .await
        .map_err(|error| workflow_error_response(state, error))?;

    enable_service_for_user(state, user_id, service).await
}

#[derive(Debug, Deserialize)]
struct ServiceEndBody {
    service: String,
}

async fn service_end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ServiceEndBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let service = body.service.trim().to_string();
    if service.is_empty() {
        return Err(validation_error("A service is required."));
    }

    let price = state
        .payments
        .price_for_service(&service)
        .await
        .map_err(payments_error_response)?
        .ok_or_else(|| validation_error(format!("No price found for service {service}")))?;

    let Some(customer_id) = user.private_str(CUSTOMER_METADATA_KEY) else {
        return Err(conflict_error("Service is not enabled."));
    };

    let subscription = state
        .payments
        .active_subscription(customer_id, &price.id)
        .await
        .map_err(payments_error_response)?
        .ok_or_else(|| conflict_error("Service is not enabled."))?;

    state
        .payments
        .cancel_subscription(&subscription.id)
        .await
        .map_err(payments_error_response)?;

    let services: Vec<String> = user
        .public_string_list(SERVICES_METADATA_KEY)
        .into_iter()
        .filter(|enabled| enabled != &service)
        .collect();
    state
        .identity
        .update_public_metadata(
            &user.id,
            metadata_patch(SERVICES_METADATA_KEY, json!(services)),
        )
        .await
        .map_err(identity_error_response)?;

    tracing::info!(
        target: "roamjs.payments",
        user_id = %user.id,
        service = %service,
        "service ended",
    );

    Ok(Json(json!({ "success": true })))
}

async fn payments_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiErrorTuple> {
    let signature = headers
        .get(PAYMENTS_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| unauthorized_error("Unauthorized"))?;

    state
        .webhook
        .verify(signature, &body)
        .map_err(|error| match error {
            WebhookError::NotConfigured => {
                internal_error("Webhook secret is not configured.")
            }
            WebhookError::InvalidHeader | WebhookError::Expired | WebhookError::Mismatch => {
                unauthorized_error("Unauthorized")
            }
        })?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|_| validation_error("Invalid webhook payload"))?;

    match event.kind.as_str() {
        "checkout.session.completed" => {
            let metadata = event
                .data
                .object
                .get("metadata")
                .cloned()
                .unwrap_or_default();
            let user_id = metadata.get("user_id").and_then(Value::as_str);
            let service = metadata.get("service").and_then(Value::as_str);
            let callback_token = metadata.get("callback_token").and_then(Value::as_str);

            match (user_id, service, callback_token) {
                (Some(user_id), Some(service), Some(callback_token)) => {
                    finish_service_start(&state, user_id, service, callback_token).await?;
                    Ok(Json(json!({ "success": true })))
                }
                _ => {
                    tracing::warn!(
                        target: "roamjs.payments",
                        event_id = event.id.as_deref().unwrap_or("<unknown>"),
                        "checkout completion event missing workflow metadata",
                    );
                    Ok(Json(json!({ "received": true })))
                }
            }
        }
        _ => Ok(Json(json!({ "received": true }))),
    }
}

#[derive(Debug, Deserialize)]
struct WebsiteLaunchBody {
    graph: String,
    domain: String,
}

async fn website_launch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WebsiteLaunchBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let graph = body.graph.trim().to_string();
    if !valid_graph(&graph) {
        return Err(validation_error(format!("Invalid graph: {}", body.graph)));
    }

    let domain = body.domain.trim().to_lowercase();
    if domain.is_empty() {
        return Err(validation_error("A domain is required."));
    }

    if user.public_metadata.contains_key(WEBSITE_METADATA_KEY) {
        return Err(conflict_error("Website is already live."));
    }

    if state
        .workflows
        .pending(WorkflowKind::WebsiteLaunch, &user.id)
        .await
        .is_some()
    {
        return Err(conflict_error("Website launch is already in progress."));
    }

    let started = state
        .workflows
        .begin(WorkflowKind::WebsiteLaunch, &user.id, Some(&graph))
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    let submission = state
        .workflows
        .record_submission("launch-website", Some(&started.workflow_id))
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    state
        .statuses
        .append("launch", &graph, Some(&user.id), "INITIALIZING")
        .await
        .map_err(|error| internal_with_report(&state, "status-store", error.to_string()))?;

    dispatch_website_job(
        &state,
        "launch-website",
        json!({
            "graph": graph,
            "domain": domain,
            "userId": user.id,
            "callbackToken": started.callback_token,
            "submissionId": submission.id,
        }),
    )
    .await;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct WebsiteGraphBody {
    graph: String,
}

async fn website_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WebsiteGraphBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let graph = body.graph.trim().to_string();
    if !valid_graph(&graph) {
        return Err(validation_error(format!("Invalid graph: {}", body.graph)));
    }

    if !user.public_metadata.contains_key(WEBSITE_METADATA_KEY) {
        return Err(conflict_error("Website is not live."));
    }

    let started = state
        .workflows
        .begin(WorkflowKind::WebsiteUpdate, &user.id, Some(&graph))
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    let submission = state
        .workflows
        .record_submission("deploy-website", Some(&started.workflow_id))
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    state
        .statuses
        .append("deploy", &graph, Some(&user.id), "STARTING")
        .await
        .map_err(|error| internal_with_report(&state, "status-store", error.to_string()))?;

    dispatch_website_job(
        &state,
        "deploy-website",
        json!({
            "graph": graph,
            "userId": user.id,
            "callbackToken": started.callback_token,
            "submissionId": submission.id,
        }),
    )
    .await;

    Ok(Json(json!({ "success": true })))
}

async fn website_shutdown(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WebsiteGraphBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let graph = body.graph.trim().to_string();
    if !valid_graph(&graph) {
        return Err(validation_error(format!("Invalid graph: {}", body.graph)));
    }

    if !user.public_metadata.contains_key(WEBSITE_METADATA_KEY) {
        return Err(conflict_error("Website is not live."));
    }

    let started = state
        .workflows
        .begin(WorkflowKind::WebsiteShutdown, &user.id, Some(&graph))
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    let submission = state
        .workflows
        .record_submission("shutdown-website", Some(&started.workflow_id))
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    state
        .statuses
        .append("launch", &graph, Some(&user.id), "SHUTTING DOWN")
        .await
        .map_err(|error| internal_with_report(&state, "status-store", error.to_string()))?;

    dispatch_website_job(
        &state,
        "shutdown-website",
        json!({
            "graph": graph,
            "userId": user.id,
            "callbackToken": started.callback_token,
            "submissionId": submission.id,
        }),
    )
    .await;

    Ok(Json(json!({ "success": true })))
}

/// Invoke-and-forget: the submission is accepted or it is not; either way the
/// caller's request succeeds and completion arrives through the callback.
async fn dispatch_website_job(state: &AppState, job_name: &str, payload: Value) {
    let submission_id = payload
        .get("submissionId")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    if let Err(error) = state.jobs.invoke(job_name, payload).await {
        tracing::warn!(
            target: "roamjs.jobs",
            job_name,
            error = %error,
            "background job submission failed",
        );
        if let Some(submission_id) = submission_id {
            let _ = state.workflows.close_submission(&submission_id, false).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebsiteCompleteBody {
    #[serde(alias = "userId")]
    user_id: String,
    graph: String,
    operation: String,
    #[serde(alias = "callbackToken")]
    callback_token: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default, alias = "submissionId")]
    submission_id: Option<String>,
    #[serde(default)]
    success: Option<bool>,
}

async fn website_complete(
    State(state): State<AppState>,
    Json(body): Json<WebsiteCompleteBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let kind = match body.operation.trim() {
        "launch" => WorkflowKind::WebsiteLaunch,
        "deploy" => WorkflowKind::WebsiteUpdate,
        "shutdown" => WorkflowKind::WebsiteShutdown,
        other => {
            return Err(validation_error(format!("Invalid operation: {other}")));
        }
    };

    state
        .workflows
        .complete(kind, &body.user_id, &body.callback_token)
        .await
        .map_err(|error| workflow_error_response(&state, error))?;

    let succeeded = body.success.unwrap_or(true);
    if !succeeded {
        let _ = state
            .workflows
            .mark_failed(kind, &body.user_id)
            .await
            .map_err(|error| workflow_error_response(&state, error))?;
    }

    let status_action = match kind {
        WorkflowKind::WebsiteUpdate => "deploy",
        _ => "launch",
    };
    let status_value = match (kind, succeeded) {
        (_, false) => "FAILURE",
        (WorkflowKind::WebsiteShutdown, true) => "INACTIVE",
        (WorkflowKind::WebsiteUpdate, true) => "SUCCESS",
        (_, true) => "LIVE",
    };

    if succeeded {
        match kind {
            WorkflowKind::WebsiteLaunch => {
                state
                    .identity
                    .update_public_metadata(
                        &body.user_id,
                        metadata_patch(
                            WEBSITE_METADATA_KEY,
                            json!({
                                "graph": body.graph,
                                "domain": body.domain,
                                "status": "LIVE",
                            }),
                        ),
                    )
                    .await
                    .map_err(identity_error_response)?;
            }
            WorkflowKind::WebsiteShutdown => {
                state
                    .identity
                    .update_public_metadata(
                        &body.user_id,
                        metadata_patch(WEBSITE_METADATA_KEY, Value::Null),
                    )
                    .await
                    .map_err(identity_error_response)?;
            }
            WorkflowKind::WebsiteUpdate | WorkflowKind::ServiceStart => {}
        }
    }

    state
        .statuses
        .append(status_action, &body.graph, Some(&body.user_id), status_value)
        .await
        .map_err(|error| internal_with_report(&state, "status-store", error.to_string()))?;

    if let Some(submission_id) = body.submission_id.as_deref() {
        let _ = state
            .workflows
            .close_submission(submission_id, succeeded)
            .await
            .map_err(|error| workflow_error_response(&state, error))?;
    }

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct WebsiteStatusQuery {
    graph: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

async fn website_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WebsiteStatusQuery>,
) -> Result<Json<Value>, ApiErrorTuple> {
    state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let graph = query
        .graph
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("A graph is required."))?;

    let action = query.action.as_deref().unwrap_or("launch");
    if !matches!(action, "launch" | "deploy") {
        return Err(validation_error(format!("Invalid action: {action}")));
    }

    let latest = state.statuses.latest(action, graph).await;

    Ok(Json(json!({
        "graph": graph,
        "action": action,
        "status": latest.as_ref().map(|record| record.status.clone()),
        "recordedAt": latest.as_ref().map(|record| record.recorded_at),
    })))
}

#[derive(Debug, Deserialize)]
struct SponsorBody {
    value: i64,
}

async fn sponsor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SponsorBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    if body.value <= 0 {
        return Err(validation_error("Sponsorship value must be greater than 0"));
    }

    let customer_id = ensure_payments_customer(&state, &user).await?;

    let receipt = state
        .payments
        .create_charge(&customer_id, body.value, "usd", "RoamJS sponsorship")
        .await
        .map_err(payments_error_response)?;

    Ok(Json(json!({ "id": receipt.id, "success": true })))
}

#[derive(Debug, Deserialize)]
struct GithubIssuesQuery {
    repo: Option<String>,
}

async fn github_issues(
    State(state): State<AppState>,
    Query(query): Query<GithubIssuesQuery>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let repo = query
        .repo
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("A repository is required."))?;

    let issues = state
        .issues
        .list_issues(repo)
        .await
        .map_err(issue_tracker_error_response)?;

    Ok(Json(json!({ "issues": issues })))
}

#[derive(Debug, Deserialize)]
struct SocialAuthBody {
    code: String,
}

async fn social_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SocialAuthBody>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let credentials = state
        .social
        .exchange_code(&body.code)
        .await
        .map_err(social_error_response)?;

    // Credentials land in private metadata only once the exchange succeeded.
    state
        .identity
        .update_private_metadata(
            &user.id,
            metadata_patch(
                SOCIAL_METADATA_KEY,
                json!({
                    "access_token": credentials.access_token,
                    "refresh_token": credentials.refresh_token,
                    "expires_in": credentials.expires_in,
                }),
            ),
        )
        .await
        .map_err(identity_error_response)?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct SocialSearchQuery {
    query: Option<String>,
}

async fn social_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SocialSearchQuery>,
) -> Result<Json<Value>, ApiErrorTuple> {
    let user = state
        .sessions
        .resolve_user(&headers)
        .await
        .map_err(auth_error_response)?;

    let search_query = query
        .query
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| validation_error("A query is required."))?;

    let access_token = user
        .private_metadata
        .get(SOCIAL_METADATA_KEY)
        .and_then(|value| value.get("access_token"))
        .and_then(Value::as_str)
        .ok_or_else(|| unauthorized_error("Social account is not connected."))?;

    let results = state
        .social
        .search(access_token, search_query)
        .await
        .map_err(social_error_response)?;

    Ok(Json(results))
}

#[cfg(test)]
mod tests;
