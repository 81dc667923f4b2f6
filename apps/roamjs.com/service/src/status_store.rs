use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

/// Append-only progress entry for a long-running provisioning action, keyed
/// by the `{action}_{graph}` composite with a timestamp sort key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: String,
    pub action: String,
    pub graph: String,
    pub user_id: Option<String>,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}

impl StatusRecord {
    #[must_use]
    pub fn composite_key(&self) -> String {
        format!("{}_{}", self.action, self.graph)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StatusStoreState {
    records: Vec<StatusRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusStoreError {
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Clone)]
pub struct StatusStore {
    state: Arc<RwLock<StatusStoreState>>,
    path: Option<PathBuf>,
}

impl StatusStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.status_store_path.clone();
        let loaded = load_state(path.as_deref());

        Self {
            state: Arc::new(RwLock::new(loaded)),
            path,
        }
    }

    pub async fn append(
        &self,
        action: &str,
        graph: &str,
        user_id: Option<&str>,
        status: &str,
    ) -> Result<StatusRecord, StatusStoreError> {
        let record = StatusRecord {
            id: format!("st_{}", Uuid::new_v4().simple()),
            action: action.to_string(),
            graph: graph.to_string(),
            user_id: user_id.map(ToString::to_string),
            status: status.to_string(),
            recorded_at: Utc::now(),
        };

        let snapshot = {
            let mut state = self.state.write().await;
            state.records.push(record.clone());
            state.clone()
        };
        self.persist_snapshot(snapshot).await?;

        tracing::debug!(
            target: "roamjs.status",
            action,
            graph,
            status,
            "status recorded",
        );

        Ok(record)
    }

    /// Last-write-wins read of the newest record for `(action, graph)`.
    pub async fn latest(&self, action: &str, graph: &str) -> Option<StatusRecord> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .filter(|record| record.action == action && record.graph == graph)
            .max_by_key(|record| record.recorded_at)
            .cloned()
    }

    pub async fn history(&self, action: &str, graph: &str) -> Vec<StatusRecord> {
        let state = self.state.read().await;
        let mut records: Vec<StatusRecord> = state
            .records
            .iter()
            .filter(|record| record.action == action && record.graph == graph)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records
    }

    /// Per-user secondary listing, newest first.
    pub async fn for_user(&self, user_id: &str) -> Vec<StatusRecord> {
        let state = self.state.read().await;
        let mut records: Vec<StatusRecord> = state
            .records
            .iter()
            .filter(|record| record.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records
    }

    async fn persist_snapshot(&self, snapshot: StatusStoreState) -> Result<(), StatusStoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| StatusStoreError::Persistence {
                    message: format!("failed to prepare status store directory: {error}"),
                })?;
        }

        let payload =
            serde_json::to_vec(&snapshot).map_err(|error| StatusStoreError::Persistence {
                message: format!("failed to encode status store payload: {error}"),
            })?;
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| StatusStoreError::Persistence {
                message: format!("failed to write status store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| StatusStoreError::Persistence {
                message: format!("failed to finalize status store payload: {error}"),
            })?;

        Ok(())
    }
}

fn load_state(path: Option<&std::path::Path>) -> StatusStoreState {
    let Some(path) = path else {
        return StatusStoreState::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return StatusStoreState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "roamjs.status",
                path = %path.display(),
                error = %error,
                "failed to read status store; booting with empty state",
            );
            return StatusStoreState::default();
        }
    };

    match serde_json::from_str::<StatusStoreState>(&raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                target: "roamjs.status",
                path = %path.display(),
                error = %error,
                "failed to parse status store; booting with empty state",
            );
            StatusStoreState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StatusStore {
        StatusStore::from_config(&Config::for_tests())
    }

    #[tokio::test]
    async fn latest_is_last_write_wins() {
        let store = test_store();
        store
            .append("launch", "dev-graph", Some("user_1"), "INITIALIZING")
            .await
            .expect("append");
        store
            .append("launch", "dev-graph", Some("user_1"), "CREATING RESOURCES")
            .await
            .expect("append");
        store
            .append("deploy", "dev-graph", Some("user_1"), "STARTING")
            .await
            .expect("append");

        let latest = store.latest("launch", "dev-graph").await.expect("latest");
        assert_eq!(latest.status, "CREATING RESOURCES");
        assert_eq!(latest.composite_key(), "launch_dev-graph");
    }

    #[tokio::test]
    async fn unknown_composite_key_has_no_status() {
        let store = test_store();
        assert!(store.latest("launch", "missing").await.is_none());
    }

    #[tokio::test]
    async fn user_listing_is_newest_first() {
        let store = test_store();
        store
            .append("launch", "graph-a", Some("user_1"), "INITIALIZING")
            .await
            .expect("append");
        store
            .append("deploy", "graph-a", Some("user_1"), "STARTING")
            .await
            .expect("append");
        store
            .append("launch", "graph-b", Some("user_2"), "INITIALIZING")
            .await
            .expect("append");

        let records = store.for_user("user_1").await;
        assert_eq!(records.len(), 2);
        assert!(records[0].recorded_at >= records[1].recorded_at);
    }
}
