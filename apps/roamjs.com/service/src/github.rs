use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum IssueTrackerError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("issue tracker request failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSummary {
    pub number: u64,
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// 1:1 passthrough to the source-control issue API; no reshaping beyond the
/// summary projection.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list_issues(&self, repo: &str) -> Result<Vec<IssueSummary>, IssueTrackerError>;

    fn name(&self) -> &'static str;
}

pub fn tracker_from_config(config: &Config) -> Arc<dyn IssueTracker> {
    if config.provider_mode == "mock" {
        return Arc::new(MockIssueTracker::default());
    }

    Arc::new(GithubIssueTracker {
        base_url: config.github_api_base_url.clone(),
        token: config.github_token.clone(),
        http: reqwest::Client::new(),
    })
}

pub fn valid_repo(repo: &str) -> bool {
    let mut segments = repo.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(owner), Some(name), None) => {
            let valid_segment = |segment: &str| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            };
            valid_segment(owner) && valid_segment(name)
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
struct GithubIssueTracker {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[async_trait]
impl IssueTracker for GithubIssueTracker {
    async fn list_issues(&self, repo: &str) -> Result<Vec<IssueSummary>, IssueTrackerError> {
        if !valid_repo(repo) {
            return Err(IssueTrackerError::Validation {
                message: format!("Invalid repository: {repo}"),
            });
        }

        let url = format!("{}/repos/{repo}/issues", self.base_url.trim_end_matches('/'));
        let mut request = self
            .http
            .get(url)
            .header("user-agent", "roamjs-api-service")
            .header("accept", "application/vnd.github+json");
        if let Some(token) = self.token.as_ref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| IssueTrackerError::Provider {
                message: format!("Unable to contact issue tracker: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IssueTrackerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Vec<IssueSummary>>()
            .await
            .map_err(|error| IssueTrackerError::Provider {
                message: format!("Invalid issue tracker response payload: {error}"),
            })
    }

    fn name(&self) -> &'static str {
        "github"
    }
}

/// Preloaded issue fixtures for tests and local development.
#[derive(Clone, Default)]
pub struct MockIssueTracker {
    issues: Arc<RwLock<HashMap<String, Vec<IssueSummary>>>>,
}

impl MockIssueTracker {
    pub async fn insert_issues(&self, repo: &str, issues: Vec<IssueSummary>) {
        let mut state = self.issues.write().await;
        state.insert(repo.to_string(), issues);
    }
}

#[async_trait]
impl IssueTracker for MockIssueTracker {
    async fn list_issues(&self, repo: &str) -> Result<Vec<IssueSummary>, IssueTrackerError> {
        if !valid_repo(repo) {
            return Err(IssueTrackerError::Validation {
                message: format!("Invalid repository: {repo}"),
            });
        }

        let state = self.issues.read().await;
        Ok(state.get(repo).cloned().unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repos_must_be_owner_slash_name() {
        assert!(valid_repo("dvargas92495/roamjs-query-builder"));
        assert!(!valid_repo("no-slash"));
        assert!(!valid_repo("a/b/c"));
        assert!(!valid_repo("a/../b"));
        assert!(!valid_repo("/b"));
    }
}
