use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

/// Identity-provider user record. Metadata is split into a caller-visible
/// partition and a system-only partition; the private partition carries
/// provider linkage (payments customer id, social credentials) and is never
/// returned to callers.
#[derive(Debug, Clone)]
pub struct IdentityUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub public_metadata: Map<String, Value>,
    pub private_metadata: Map<String, Value>,
}

impl IdentityUser {
    #[must_use]
    pub fn public_str(&self, key: &str) -> Option<&str> {
        self.public_metadata.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn private_str(&self, key: &str) -> Option<&str> {
        self.private_metadata.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn public_string_list(&self, key: &str) -> Vec<String> {
        self.public_metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("identity provider request failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

/// Metadata patches merge key by key; a `null` value removes the key.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn user_by_session_token(&self, session_token: &str)
    -> Result<IdentityUser, IdentityError>;

    async fn user_by_id(&self, user_id: &str) -> Result<IdentityUser, IdentityError>;

    async fn user_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError>;

    async fn update_public_metadata(
        &self,
        user_id: &str,
        patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError>;

    async fn update_private_metadata(
        &self,
        user_id: &str,
        patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError>;

    fn name(&self) -> &'static str;
}

pub fn provider_from_config(config: &Config) -> Arc<dyn IdentityProvider> {
    if config.provider_mode == "mock" {
        return Arc::new(MockIdentityProvider::default());
    }

    match config.identity_api_key.as_ref() {
        Some(api_key) => Arc::new(ClerkIdentityProvider {
            api_key: api_key.clone(),
            base_url: config.identity_api_base_url.clone(),
            http: reqwest::Client::new(),
        }),
        None => Arc::new(UnavailableIdentityProvider {
            message: "Identity provider credentials are not configured.".to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
struct ClerkIdentityProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
struct UnavailableIdentityProvider {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ClerkSessionPayload {
    user_id: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClerkUserPayload {
    id: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email_addresses: Vec<ClerkEmailAddress>,
    #[serde(default)]
    primary_email_address_id: Option<String>,
    #[serde(default)]
    public_metadata: Value,
    #[serde(default)]
    private_metadata: Value,
}

#[derive(Debug, Deserialize)]
struct ClerkEmailAddress {
    id: String,
    email_address: String,
}

impl ClerkUserPayload {
    fn into_user(self) -> IdentityUser {
        let email = self
            .primary_email_address_id
            .as_ref()
            .and_then(|primary| {
                self.email_addresses
                    .iter()
                    .find(|entry| &entry.id == primary)
            })
            .or_else(|| self.email_addresses.first())
            .map(|entry| entry.email_address.trim().to_lowercase())
            .unwrap_or_default();

        let name = match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => format!("{} {}", first.trim(), last.trim()),
            (Some(first), None) => first.trim().to_string(),
            (None, Some(last)) => last.trim().to_string(),
            (None, None) => String::new(),
        };

        IdentityUser {
            id: self.id,
            email,
            name: name.trim().to_string(),
            public_metadata: metadata_map(self.public_metadata),
            private_metadata: metadata_map(self.private_metadata),
        }
    }
}

fn metadata_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn valid_provider_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ClerkIdentityProvider {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, IdentityError> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|error| IdentityError::Provider {
                message: format!("Unable to contact identity provider: {error}"),
            })?;

        decode_identity_response(response).await
    }

    async fn patch_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<T, IdentityError> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|error| IdentityError::Provider {
                message: format!("Unable to contact identity provider: {error}"),
            })?;

        decode_identity_response(response).await
    }
}

async fn decode_identity_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, IdentityError> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(match status.as_u16() {
            401 | 403 => IdentityError::Unauthorized {
                message: "Unauthorized".to_string(),
            },
            404 => IdentityError::NotFound {
                message: "User not found".to_string(),
            },
            other => IdentityError::Upstream { status: other, body },
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|error| IdentityError::Provider {
            message: format!("Invalid identity provider response payload: {error}"),
        })
}

#[async_trait]
impl IdentityProvider for ClerkIdentityProvider {
    async fn user_by_session_token(
        &self,
        session_token: &str,
    ) -> Result<IdentityUser, IdentityError> {
        if !valid_provider_id(session_token) {
            return Err(IdentityError::Unauthorized {
                message: "Unauthorized".to_string(),
            });
        }

        let session: ClerkSessionPayload =
            self.get_json(&format!("sessions/{session_token}")).await?;

        if session.status.as_deref() != Some("active") {
            return Err(IdentityError::Unauthorized {
                message: "Unauthorized".to_string(),
            });
        }

        let user_id = session.user_id.unwrap_or_default();
        if user_id.is_empty() {
            return Err(IdentityError::Unauthorized {
                message: "Unauthorized".to_string(),
            });
        }

        self.user_by_id(&user_id).await
    }

    async fn user_by_id(&self, user_id: &str) -> Result<IdentityUser, IdentityError> {
        if !valid_provider_id(user_id) {
            return Err(IdentityError::NotFound {
                message: "User not found".to_string(),
            });
        }

        let payload: ClerkUserPayload = self.get_json(&format!("users/{user_id}")).await?;
        Ok(payload.into_user())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        let normalized = email.trim().to_lowercase();
        if normalized.is_empty() {
            return Ok(None);
        }

        let url = format!("{}/users", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .query(&[("email_address", normalized.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|error| IdentityError::Provider {
                message: format!("Unable to contact identity provider: {error}"),
            })?;

        let users: Vec<ClerkUserPayload> = decode_identity_response(response).await?;
        Ok(users.into_iter().next().map(ClerkUserPayload::into_user))
    }

    async fn update_public_metadata(
        &self,
        user_id: &str,
        patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError> {
        let payload = serde_json::json!({ "public_metadata": Value::Object(patch) });
        let updated: ClerkUserPayload = self
            .patch_json(&format!("users/{user_id}/metadata"), &payload)
            .await?;
        Ok(updated.into_user())
    }

    async fn update_private_metadata(
        &self,
        user_id: &str,
        patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError> {
        let payload = serde_json::json!({ "private_metadata": Value::Object(patch) });
        let updated: ClerkUserPayload = self
            .patch_json(&format!("users/{user_id}/metadata"), &payload)
            .await?;
        Ok(updated.into_user())
    }

    fn name(&self) -> &'static str {
        "clerk"
    }
}

#[async_trait]
impl IdentityProvider for UnavailableIdentityProvider {
    async fn user_by_session_token(
        &self,
        _session_token: &str,
    ) -> Result<IdentityUser, IdentityError> {
        Err(IdentityError::Provider {
            message: self.message.clone(),
        })
    }

    async fn user_by_id(&self, _user_id: &str) -> Result<IdentityUser, IdentityError> {
        Err(IdentityError::Provider {
            message: self.message.clone(),
        })
    }

    async fn user_by_email(&self, _email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        Err(IdentityError::Provider {
            message: self.message.clone(),
        })
    }

    async fn update_public_metadata(
        &self,
        _user_id: &str,
        _patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError> {
        Err(IdentityError::Provider {
            message: self.message.clone(),
        })
    }

    async fn update_private_metadata(
        &self,
        _user_id: &str,
        _patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError> {
        Err(IdentityError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "clerk"
    }
}

#[derive(Debug, Default)]
struct MockIdentityState {
    users: HashMap<String, IdentityUser>,
    sessions: HashMap<String, String>,
}

/// In-memory identity provider used by tests and local development.
#[derive(Clone, Default)]
pub struct MockIdentityProvider {
    state: Arc<RwLock<MockIdentityState>>,
}

impl MockIdentityProvider {
    pub async fn insert_user(&self, email: &str, name: &str) -> IdentityUser {
        let user = IdentityUser {
            id: format!("user_{}", Uuid::new_v4().simple()),
            email: email.trim().to_lowercase(),
            name: name.trim().to_string(),
            public_metadata: Map::new(),
            private_metadata: Map::new(),
        };

        let mut state = self.state.write().await;
        state.users.insert(user.id.clone(), user.clone());
        user
    }

    pub async fn issue_session(&self, user_id: &str) -> String {
        let token = format!("sess_{}", Uuid::new_v4().simple());
        let mut state = self.state.write().await;
        state.sessions.insert(token.clone(), user_id.to_string());
        token
    }

    pub async fn user_snapshot(&self, user_id: &str) -> Option<IdentityUser> {
        let state = self.state.read().await;
        state.users.get(user_id).cloned()
    }
}

fn apply_metadata_patch(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn user_by_session_token(
        &self,
        session_token: &str,
    ) -> Result<IdentityUser, IdentityError> {
        let state = self.state.read().await;
        let user_id = state
            .sessions
            .get(session_token)
            .ok_or_else(|| IdentityError::Unauthorized {
                message: "Unauthorized".to_string(),
            })?;

        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdentityError::Unauthorized {
                message: "Unauthorized".to_string(),
            })
    }

    async fn user_by_id(&self, user_id: &str) -> Result<IdentityUser, IdentityError> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound {
                message: "User not found".to_string(),
            })
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        let normalized = email.trim().to_lowercase();
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|user| user.email == normalized)
            .cloned())
    }

    async fn update_public_metadata(
        &self,
        user_id: &str,
        patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::NotFound {
                message: "User not found".to_string(),
            })?;

        apply_metadata_patch(&mut user.public_metadata, patch);
        Ok(user.clone())
    }

    async fn update_private_metadata(
        &self,
        user_id: &str,
        patch: Map<String, Value>,
    ) -> Result<IdentityUser, IdentityError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| IdentityError::NotFound {
                message: "User not found".to_string(),
            })?;

        apply_metadata_patch(&mut user.private_metadata, patch);
        Ok(user.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metadata_patch_merges_and_null_removes() {
        let provider = MockIdentityProvider::default();
        let user = provider.insert_user("dev@roamjs.test", "Dev").await;

        let mut patch = Map::new();
        patch.insert("paths".to_string(), serde_json::json!(["docs/query"]));
        patch.insert("theme".to_string(), serde_json::json!("dark"));
        provider
            .update_public_metadata(&user.id, patch)
            .await
            .expect("patch should apply");

        let mut removal = Map::new();
        removal.insert("theme".to_string(), Value::Null);
        let updated = provider
            .update_public_metadata(&user.id, removal)
            .await
            .expect("removal should apply");

        assert_eq!(updated.public_string_list("paths"), vec!["docs/query"]);
        assert!(!updated.public_metadata.contains_key("theme"));
    }

    #[tokio::test]
    async fn unknown_session_token_is_unauthorized() {
        let provider = MockIdentityProvider::default();
        let result = provider.user_by_session_token("sess_missing").await;
        assert!(matches!(result, Err(IdentityError::Unauthorized { .. })));
    }

    #[test]
    fn provider_ids_reject_path_traversal() {
        assert!(valid_provider_id("user_2iXaF9"));
        assert!(!valid_provider_id("../users"));
        assert!(!valid_provider_id(""));
    }
}
