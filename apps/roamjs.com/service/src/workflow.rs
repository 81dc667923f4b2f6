use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    ServiceStart,
    WebsiteLaunch,
    WebsiteUpdate,
    WebsiteShutdown,
}

impl WorkflowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceStart => "service_start",
            Self::WebsiteLaunch => "website_launch",
            Self::WebsiteUpdate => "website_update",
            Self::WebsiteShutdown => "website_shutdown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "service_start" => Some(Self::ServiceStart),
            "website_launch" => Some(Self::WebsiteLaunch),
            "website_update" => Some(Self::WebsiteUpdate),
            "website_shutdown" => Some(Self::WebsiteShutdown),
            _ => None,
        }
    }
}

/// A record in the `Idle` state is simply absent from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    AwaitingExternalConfirmation,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub kind: WorkflowKind,
    pub user_id: String,
    pub graph: Option<String>,
    /// SHA-256 digest of the callback token. The raw token is handed to the
    /// background job once and never persisted; consumed on completion.
    pub token_digest: Option<String>,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StartedWorkflow {
    pub workflow_id: String,
    pub callback_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSubmissionStatus {
    Submitted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmissionRecord {
    pub id: String,
    pub job_name: String,
    pub workflow_id: Option<String>,
    pub status: JobSubmissionStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct WorkflowStoreState {
    workflows: HashMap<String, WorkflowRecord>,
    submissions: HashMap<String, JobSubmissionRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{message}")]
    Unauthorized { message: String },
    #[error("{message}")]
    Persistence { message: String },
}

/// Workflow-state table keyed by `(kind, user)`, separate from user profile
/// data. Pending records expire after the configured TTL and are purged on
/// access, so an abandoned background job cannot leak a live token forever.
#[derive(Clone)]
pub struct WorkflowStore {
    state: Arc<RwLock<WorkflowStoreState>>,
    path: Option<PathBuf>,
    ttl: Duration,
}

impl WorkflowStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.workflow_store_path.clone();
        let loaded = load_state(path.as_deref());

        Self {
            state: Arc::new(RwLock::new(loaded)),
            path,
            ttl: Duration::seconds(config.workflow_ttl_seconds.max(60) as i64),
        }
    }

    async fn persist_snapshot(&self, snapshot: WorkflowStoreState) -> Result<(), WorkflowError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| WorkflowError::Persistence {
                    message: format!("failed to prepare workflow store directory: {error}"),
                })?;
        }

        let payload =
            serde_json::to_vec(&snapshot).map_err(|error| WorkflowError::Persistence {
                message: format!("failed to encode workflow store payload: {error}"),
            })?;
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| WorkflowError::Persistence {
                message: format!("failed to write workflow store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| WorkflowError::Persistence {
                message: format!("failed to finalize workflow store payload: {error}"),
            })?;

        Ok(())
    }

    /// Starts (or restarts) a workflow for the caller. A fresh callback token
    /// is generated on every call; an earlier pending token for the same
    /// `(kind, user)` key stops matching from this point on.
    pub async fn begin(
        &self,
        kind: WorkflowKind,
        user_id: &str,
        graph: Option<&str>,
    ) -> Result<StartedWorkflow, WorkflowError> {
        let now = Utc::now();
        let callback_token = format!("cb_{}", Uuid::new_v4().simple());
        let record = WorkflowRecord {
            id: format!("wf_{}", Uuid::new_v4().simple()),
            kind,
            user_id: user_id.to_string(),
            graph: graph.map(ToString::to_string),
            token_digest: Some(token_digest(&callback_token)),
            state: WorkflowState::AwaitingExternalConfirmation,
            created_at: now,
            updated_at: now,
            expires_at: now + self.ttl,
        };

        let workflow_id = record.id.clone();
        let snapshot = {
            let mut state = self.state.write().await;
            purge_expired(&mut state, now);
            state
                .workflows
                .insert(composite_key(kind, user_id), record);
            state.clone()
        };
        self.persist_snapshot(snapshot).await?;

        tracing::info!(
            target: "roamjs.workflow",
            kind = kind.as_str(),
            user_id,
            workflow_id = %workflow_id,
            "workflow started",
        );

        Ok(StartedWorkflow {
            workflow_id,
            callback_token,
        })
    }

    /// Verifies the presented callback token against the stored digest and
    /// consumes it. A mismatch, a consumed token, or an expired record all
    /// answer `Unauthorized` without mutating anything.
    pub async fn complete(
        &self,
        kind: WorkflowKind,
        user_id: &str,
        presented_token: &str,
    ) -> Result<WorkflowRecord, WorkflowError> {
        let now = Utc::now();

        let (record, snapshot) = {
            let mut state = self.state.write().await;
            purge_expired(&mut state, now);

            let key = composite_key(kind, user_id);
            let Some(record) = state.workflows.get_mut(&key) else {
                return Err(unauthorized());
            };

            if record.state != WorkflowState::AwaitingExternalConfirmation {
                return Err(unauthorized());
            }

            let matches = record
                .token_digest
                .as_deref()
                .is_some_and(|digest| digest == token_digest(presented_token));
            if !matches {
                return Err(unauthorized());
            }

            record.state = WorkflowState::Done;
            record.token_digest = None;
            record.updated_at = now;
            let record = record.clone();

            (record, state.clone())
        };
        self.persist_snapshot(snapshot).await?;

        tracing::info!(
            target: "roamjs.workflow",
            kind = kind.as_str(),
            user_id,
            workflow_id = %record.id,
            "workflow completed",
        );

        Ok(record)
    }

    pub async fn mark_failed(
        &self,
        kind: WorkflowKind,
        user_id: &str,
    ) -> Result<Option<WorkflowRecord>, WorkflowError> {
        let now = Utc::now();

        let (record, snapshot) = {
            let mut state = self.state.write().await;
            purge_expired(&mut state, now);

            let key = composite_key(kind, user_id);
            let record = state.workflows.get_mut(&key).map(|record| {
                record.state = WorkflowState::Failed;
                record.token_digest = None;
                record.updated_at = now;
                record.clone()
            });

            (record, state.clone())
        };
        self.persist_snapshot(snapshot).await?;

        Ok(record)
    }

    pub async fn pending(&self, kind: WorkflowKind, user_id: &str) -> Option<WorkflowRecord> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        purge_expired(&mut state, now);

        state
            .workflows
            .get(&composite_key(kind, user_id))
            .filter(|record| record.state == WorkflowState::AwaitingExternalConfirmation)
            .cloned()
    }

    pub async fn record_submission(
        &self,
        job_name: &str,
        workflow_id: Option<&str>,
    ) -> Result<JobSubmissionRecord, WorkflowError> {
        let record = JobSubmissionRecord {
            id: format!("job_{}", Uuid::new_v4().simple()),
            job_name: job_name.to_string(),
            workflow_id: workflow_id.map(ToString::to_string),
            status: JobSubmissionStatus::Submitted,
            submitted_at: Utc::now(),
            completed_at: None,
        };

        let snapshot = {
            let mut state = self.state.write().await;
            state.submissions.insert(record.id.clone(), record.clone());
            state.clone()
        };
        self.persist_snapshot(snapshot).await?;

        Ok(record)
    }

    pub async fn close_submission(
        &self,
        submission_id: &str,
        success: bool,
    ) -> Result<Option<JobSubmissionRecord>, WorkflowError> {
        let (record, snapshot) = {
            let mut state = self.state.write().await;
            let record = state.submissions.get_mut(submission_id).map(|record| {
                record.status = if success {
                    JobSubmissionStatus::Completed
                } else {
                    JobSubmissionStatus::Failed
                };
                record.completed_at = Some(Utc::now());
                record.clone()
            });
            (record, state.clone())
        };
        self.persist_snapshot(snapshot).await?;

        Ok(record)
    }

    pub async fn submission(&self, submission_id: &str) -> Option<JobSubmissionRecord> {
        let state = self.state.read().await;
        state.submissions.get(submission_id).cloned()
    }

    #[cfg(test)]
    pub async fn force_expire(&self, kind: WorkflowKind, user_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.workflows.get_mut(&composite_key(kind, user_id)) {
            record.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

fn composite_key(kind: WorkflowKind, user_id: &str) -> String {
    format!("{}:{user_id}", kind.as_str())
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn purge_expired(state: &mut WorkflowStoreState, now: DateTime<Utc>) {
    state.workflows.retain(|_, record| record.expires_at > now);
}

fn unauthorized() -> WorkflowError {
    WorkflowError::Unauthorized {
        message: "Unauthorized".to_string(),
    }
}

fn load_state(path: Option<&std::path::Path>) -> WorkflowStoreState {
    let Some(path) = path else {
        return WorkflowStoreState::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return WorkflowStoreState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "roamjs.workflow",
                path = %path.display(),
                error = %error,
                "failed to read workflow store; booting with empty state",
            );
            return WorkflowStoreState::default();
        }
    };

    match serde_json::from_str::<WorkflowStoreState>(&raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                target: "roamjs.workflow",
                path = %path.display(),
                error = %error,
                "failed to parse workflow store; booting with empty state",
            );
            WorkflowStoreState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_store() -> WorkflowStore {
        WorkflowStore::from_config(&Config::for_tests())
    }

    #[tokio::test]
    async fn callback_tokens_are_distinct_across_starts() {
        let store = test_store();
        let first = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");
        let second = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");

        assert_ne!(first.callback_token, second.callback_token);
    }

    #[tokio::test]
    async fn mismatched_token_is_rejected_without_mutation() {
        let store = test_store();
        let started = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");

        let result = store
            .complete(WorkflowKind::WebsiteLaunch, "user_1", "cb_wrong")
            .await;
        assert!(matches!(result, Err(WorkflowError::Unauthorized { .. })));

        // The pending record is untouched and the right token still works.
        let record = store
            .complete(WorkflowKind::WebsiteLaunch, "user_1", &started.callback_token)
            .await
            .expect("correct token completes");
        assert_eq!(record.state, WorkflowState::Done);
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let store = test_store();
        let started = store
            .begin(WorkflowKind::ServiceStart, "user_1", None)
            .await
            .expect("begin");

        store
            .complete(WorkflowKind::ServiceStart, "user_1", &started.callback_token)
            .await
            .expect("first completion");

        let replay = store
            .complete(WorkflowKind::ServiceStart, "user_1", &started.callback_token)
            .await;
        assert!(matches!(replay, Err(WorkflowError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn restarting_invalidates_the_previous_token() {
        let store = test_store();
        let first = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");
        let second = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");

        let stale = store
            .complete(WorkflowKind::WebsiteLaunch, "user_1", &first.callback_token)
            .await;
        assert!(matches!(stale, Err(WorkflowError::Unauthorized { .. })));

        store
            .complete(WorkflowKind::WebsiteLaunch, "user_1", &second.callback_token)
            .await
            .expect("fresh token completes");
    }

    #[tokio::test]
    async fn expired_pending_records_are_purged_on_access() {
        let store = test_store();
        let started = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");

        store.force_expire(WorkflowKind::WebsiteLaunch, "user_1").await;

        assert!(store.pending(WorkflowKind::WebsiteLaunch, "user_1").await.is_none());
        let result = store
            .complete(WorkflowKind::WebsiteLaunch, "user_1", &started.callback_token)
            .await;
        assert!(matches!(result, Err(WorkflowError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn submissions_track_their_lifecycle() {
        let store = test_store();
        let submission = store
            .record_submission("launch-website", Some("wf_abc"))
            .await
            .expect("submission recorded");
        assert_eq!(submission.status, JobSubmissionStatus::Submitted);

        let closed = store
            .close_submission(&submission.id, true)
            .await
            .expect("close persists")
            .expect("submission exists");
        assert_eq!(closed.status, JobSubmissionStatus::Completed);
        assert!(closed.completed_at.is_some());
    }

    #[tokio::test]
    async fn store_state_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::for_tests();
        config.workflow_store_path = Some(dir.path().join("workflows.json"));

        let store = WorkflowStore::from_config(&config);
        let started = store
            .begin(WorkflowKind::WebsiteLaunch, "user_1", Some("graph"))
            .await
            .expect("begin");

        let reloaded = WorkflowStore::from_config(&config);
        let record = reloaded
            .complete(WorkflowKind::WebsiteLaunch, "user_1", &started.callback_token)
            .await
            .expect("token verifies after reload");
        assert_eq!(record.state, WorkflowState::Done);
    }
}
