use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum SocialError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("social network request failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct SocialCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

/// OAuth code exchange plus a search passthrough using the exchanged token.
#[async_trait]
pub trait SocialNetwork: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<SocialCredentials, SocialError>;

    async fn search(&self, access_token: &str, query: &str) -> Result<Value, SocialError>;

    fn name(&self) -> &'static str;
}

pub fn network_from_config(config: &Config) -> Arc<dyn SocialNetwork> {
    if config.provider_mode == "mock" {
        return Arc::new(MockSocialNetwork::default());
    }

    match (
        config.social_client_id.as_ref(),
        config.social_client_secret.as_ref(),
    ) {
        (Some(client_id), Some(client_secret)) => Arc::new(TwitterSocialNetwork {
            base_url: config.social_api_base_url.clone(),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            redirect_uri: config.social_redirect_uri.clone(),
            http: reqwest::Client::new(),
        }),
        _ => Arc::new(UnavailableSocialNetwork {
            message: "Social network credentials are not configured.".to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
struct TwitterSocialNetwork {
    base_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OauthTokenPayload {
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[async_trait]
impl SocialNetwork for TwitterSocialNetwork {
    async fn exchange_code(&self, code: &str) -> Result<SocialCredentials, SocialError> {
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Err(SocialError::Validation {
                message: "An authorization code is required.".to_string(),
            });
        }

        let url = format!("{}/2/oauth2/token", self.base_url.trim_end_matches('/'));
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), trimmed.to_string()),
            ("client_id".to_string(), self.client_id.clone()),
        ];
        if let Some(redirect_uri) = self.redirect_uri.as_ref() {
            form.push(("redirect_uri".to_string(), redirect_uri.clone()));
        }

        let response = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|error| SocialError::Provider {
                message: format!("Unable to contact social network: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(SocialError::Unauthorized {
                    message: "That authorization code is invalid or expired.".to_string(),
                });
            }
            return Err(SocialError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let payload: OauthTokenPayload =
            response.json().await.map_err(|error| SocialError::Provider {
                message: format!("Invalid social network response payload: {error}"),
            })?;

        let access_token = payload.access_token.unwrap_or_default();
        if access_token.is_empty() {
            return Err(SocialError::Provider {
                message: "Social network token response was incomplete.".to_string(),
            });
        }

        Ok(SocialCredentials {
            access_token,
            refresh_token: payload.refresh_token,
            expires_in: payload.expires_in,
        })
    }

    async fn search(&self, access_token: &str, query: &str) -> Result<Value, SocialError> {
        let url = format!(
            "{}/2/tweets/search/recent",
            self.base_url.trim_end_matches('/')
        );

        let response = self
            .http
            .get(url)
            .query(&[("query", query)])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| SocialError::Provider {
                message: format!("Unable to contact social network: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SocialError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(|error| SocialError::Provider {
            message: format!("Invalid social network response payload: {error}"),
        })
    }

    fn name(&self) -> &'static str {
        "twitter"
    }
}

struct UnavailableSocialNetwork {
    message: String,
}

#[async_trait]
impl SocialNetwork for UnavailableSocialNetwork {
    async fn exchange_code(&self, _code: &str) -> Result<SocialCredentials, SocialError> {
        Err(SocialError::Provider {
            message: self.message.clone(),
        })
    }

    async fn search(&self, _access_token: &str, _query: &str) -> Result<Value, SocialError> {
        Err(SocialError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "twitter"
    }
}

#[derive(Default)]
struct MockSocialState {
    codes: HashMap<String, SocialCredentials>,
    results: HashMap<String, Value>,
}

/// Deterministic OAuth exchange for tests: seeded codes resolve to seeded
/// credentials, everything else is rejected as an invalid code.
#[derive(Clone, Default)]
pub struct MockSocialNetwork {
    state: Arc<RwLock<MockSocialState>>,
}

impl MockSocialNetwork {
    pub async fn seed_code(&self, code: &str) -> SocialCredentials {
        let credentials = SocialCredentials {
            access_token: format!("soc_{}", Uuid::new_v4().simple()),
            refresh_token: None,
            expires_in: Some(7200),
        };

        let mut state = self.state.write().await;
        state.codes.insert(code.to_string(), credentials.clone());
        credentials
    }

    pub async fn seed_search_result(&self, query: &str, result: Value) {
        let mut state = self.state.write().await;
        state.results.insert(query.to_string(), result);
    }
}

#[async_trait]
impl SocialNetwork for MockSocialNetwork {
    async fn exchange_code(&self, code: &str) -> Result<SocialCredentials, SocialError> {
        let state = self.state.read().await;
        state
            .codes
            .get(code.trim())
            .cloned()
            .ok_or_else(|| SocialError::Unauthorized {
                message: "That authorization code is invalid or expired.".to_string(),
            })
    }

    async fn search(&self, _access_token: &str, query: &str) -> Result<Value, SocialError> {
        let state = self.state.read().await;
        Ok(state
            .results
            .get(query)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "data": [] })))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
