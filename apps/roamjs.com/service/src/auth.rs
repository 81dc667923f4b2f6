use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::identity::{IdentityError, IdentityProvider, IdentityUser};

const SESSION_COOKIE_NAME: &str = "roamjs_session";
const NO_ACTIVE_SESSION: &str = "No Active Session";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("identity provider request failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

/// Pending sign-in record. Records older than the configured TTL are deleted
/// on lookup and treated as not found.
#[derive(Debug, Clone)]
pub struct SessionRequestRecord {
    pub request_id: String,
    pub email: String,
    pub session_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionRequestState {
    requests: HashMap<String, SessionRequestRecord>,
}

#[derive(Clone)]
pub struct SessionService {
    identity: Arc<dyn IdentityProvider>,
    state: Arc<RwLock<SessionRequestState>>,
    request_ttl: Duration,
}

impl SessionService {
    pub fn new(identity: Arc<dyn IdentityProvider>, request_ttl_seconds: u64) -> Self {
        Self {
            identity,
            state: Arc::new(RwLock::new(SessionRequestState::default())),
            request_ttl: Duration::seconds(request_ttl_seconds.max(1) as i64),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.identity.name()
    }

    pub async fn create_session_request(
        &self,
        email: String,
    ) -> Result<SessionRequestRecord, AuthError> {
        let normalized = email.trim().to_lowercase();
        if normalized.is_empty() || !normalized.contains('@') {
            return Err(AuthError::Validation {
                message: "A valid email is required.".to_string(),
            });
        }

        let now = Utc::now();
        let record = SessionRequestRecord {
            request_id: format!("sreq_{}", Uuid::new_v4().simple()),
            email: normalized,
            session_token: None,
            created_at: now,
            expires_at: now + self.request_ttl,
        };

        let mut state = self.state.write().await;
        state
            .requests
            .insert(record.request_id.clone(), record.clone());
        Ok(record)
    }

    /// Expired records are removed and reported as absent. Repeated lookups
    /// of the same expired or unknown id behave identically.
    pub async fn lookup_session_request(&self, request_id: &str) -> Option<SessionRequestRecord> {
        let mut state = self.state.write().await;
        let record = state.requests.get(request_id)?.clone();

        if record.expires_at <= Utc::now() {
            state.requests.remove(request_id);
            tracing::debug!(
                target: "roamjs.auth",
                request_id,
                "expired session request deleted on lookup",
            );
            return None;
        }

        Some(record)
    }

    pub async fn attach_session_token(
        &self,
        request_id: &str,
        session_token: String,
    ) -> Result<SessionRequestRecord, AuthError> {
        let token = session_token.trim().to_string();
        if token.is_empty() {
            return Err(AuthError::Validation {
                message: "A session token is required.".to_string(),
            });
        }

        let mut state = self.state.write().await;
        let Some(record) = state.requests.get_mut(request_id) else {
            return Err(AuthError::NotFound {
                message: "Session request not found.".to_string(),
            });
        };

        if record.expires_at <= Utc::now() {
            state.requests.remove(request_id);
            return Err(AuthError::NotFound {
                message: "Session request not found.".to_string(),
            });
        }

        record.session_token = Some(token);
        Ok(record.clone())
    }

    /// Resolves the caller from the bearer token or session cookie. A missing
    /// or rejected credential is reported as "No Active Session".
    pub async fn resolve_user(&self, headers: &HeaderMap) -> Result<IdentityUser, AuthError> {
        let Some(token) = session_token_from_headers(headers) else {
            return Err(AuthError::Unauthorized {
                message: NO_ACTIVE_SESSION.to_string(),
            });
        };

        match self.identity.user_by_session_token(&token).await {
            Ok(user) => Ok(user),
            Err(IdentityError::Unauthorized { .. } | IdentityError::NotFound { .. }) => {
                Err(AuthError::Unauthorized {
                    message: NO_ACTIVE_SESSION.to_string(),
                })
            }
            Err(IdentityError::Provider { message }) => Err(AuthError::Provider { message }),
            Err(IdentityError::Upstream { status, body }) => {
                Err(AuthError::Upstream { status, body })
            }
        }
    }

    #[cfg(test)]
    pub async fn force_expire_session_request(&self, request_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.requests.get_mut(request_id) {
            record.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

pub fn session_token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let trimmed = value.trim();
        if let Some(token) = trimmed.strip_prefix("Bearer ").or_else(|| {
            trimmed.strip_prefix("bearer ")
        }) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let cookie_header = headers.get(COOKIE).and_then(|v| v.to_str().ok())?;
    for part in cookie_header.split(';') {
        let mut pieces = part.trim().splitn(2, '=');
        let name = pieces.next()?.trim();
        if name == SESSION_COOKIE_NAME {
            let value = pieces.next().unwrap_or_default().trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentityProvider;
    use axum::http::HeaderValue;

    fn service_with_mock() -> (SessionService, MockIdentityProvider) {
        let provider = MockIdentityProvider::default();
        let service = SessionService::new(Arc::new(provider.clone()), 600);
        (service, provider)
    }

    #[tokio::test]
    async fn missing_credential_is_no_active_session() {
        let (service, _provider) = service_with_mock();
        let result = service.resolve_user(&HeaderMap::new()).await;
        match result {
            Err(AuthError::Unauthorized { message }) => assert_eq!(message, "No Active Session"),
            other => panic!("expected unauthorized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bearer_token_resolves_user() {
        let (service, provider) = service_with_mock();
        let user = provider.insert_user("dev@roamjs.test", "Dev").await;
        let token = provider.issue_session(&user.id).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
        );

        let resolved = service.resolve_user(&headers).await.expect("user resolves");
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn session_cookie_resolves_user() {
        let (service, provider) = service_with_mock();
        let user = provider.insert_user("dev@roamjs.test", "Dev").await;
        let token = provider.issue_session(&user.id).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; roamjs_session={token}"))
                .expect("header value"),
        );

        let resolved = service.resolve_user(&headers).await.expect("user resolves");
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn expired_session_request_is_deleted_idempotently() {
        let (service, _provider) = service_with_mock();
        let record = service
            .create_session_request("dev@roamjs.test".to_string())
            .await
            .expect("request created");

        service.force_expire_session_request(&record.request_id).await;

        assert!(
            service
                .lookup_session_request(&record.request_id)
                .await
                .is_none()
        );
        // The record is gone; a second lookup behaves the same way.
        assert!(
            service
                .lookup_session_request(&record.request_id)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn attach_token_rejects_expired_request() {
        let (service, _provider) = service_with_mock();
        let record = service
            .create_session_request("dev@roamjs.test".to_string())
            .await
            .expect("request created");

        service.force_expire_session_request(&record.request_id).await;

        let result = service
            .attach_session_token(&record.request_id, "sess_abc".to_string())
            .await;
        assert!(matches!(result, Err(AuthError::NotFound { .. })));
    }
}
