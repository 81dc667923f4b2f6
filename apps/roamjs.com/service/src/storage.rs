use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("storage request failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

/// Object-storage gateway. Versioned extension releases live under
/// `{extensionId}/{timestamp}/...`, published documentation under
/// `markdown/{path}.md`, and path reservations as placeholder objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn name(&self) -> &'static str;
}

pub fn store_from_config(config: &Config) -> Arc<dyn ObjectStore> {
    if config.provider_mode == "mock" {
        return Arc::new(MemoryObjectStore::default());
    }

    match config.storage_base_url.as_ref() {
        Some(base_url) => Arc::new(HttpObjectStore {
            base_url: base_url.clone(),
            api_key: config.storage_api_key.clone(),
            http: reqwest::Client::new(),
        }),
        None => Arc::new(UnavailableObjectStore {
            message: "Object storage is not configured.".to_string(),
        }),
    }
}

pub fn valid_object_key(key: &str) -> bool {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return false;
    }

    key.split('/').all(|segment| {
        !segment.is_empty()
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    })
}

#[must_use]
pub fn markdown_key(path: &str) -> String {
    format!("markdown/{path}.md")
}

#[must_use]
pub fn reservation_key(path: &str) -> String {
    format!("{path}/index")
}

/// Distinct release timestamps under `{extensionId}/`, newest first.
pub async fn list_extension_versions(
    store: &dyn ObjectStore,
    extension_id: &str,
) -> Result<Vec<String>, StorageError> {
    let keys = store.list_keys(&format!("{extension_id}/")).await?;

    let mut versions: Vec<String> = keys
        .iter()
        .filter_map(|key| key.split('/').nth(1))
        .filter(|segment| !segment.is_empty())
        .map(ToString::to_string)
        .collect();
    versions.sort();
    versions.dedup();
    versions.reverse();

    Ok(versions)
}

#[derive(Debug, Clone)]
struct HttpObjectStore {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ListKeysPayload {
    #[serde(default)]
    keys: Vec<String>,
}

impl HttpObjectStore {
    fn object_url(&self, key: &str) -> Result<String, StorageError> {
        if !valid_object_key(key) {
            return Err(StorageError::Validation {
                message: format!("Invalid object key: {key}"),
            });
        }
        Ok(format!("{}/objects/{key}", self.base_url.trim_end_matches('/')))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_ref() {
            Some(api_key) => request.bearer_auth(api_key),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.http.put(url))
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|error| StorageError::Provider {
                message: format!("Unable to contact object storage: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|error| StorageError::Provider {
                message: format!("Unable to contact object storage: {error}"),
            })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| StorageError::Provider {
                message: format!("Unable to read object body: {error}"),
            })?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let url = self.object_url(key)?;
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(|error| StorageError::Provider {
                message: format!("Unable to contact object storage: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = format!("{}/objects", self.base_url.trim_end_matches('/'));
        let response = self
            .authorize(self.http.get(url).query(&[("prefix", prefix)]))
            .send()
            .await
            .map_err(|error| StorageError::Provider {
                message: format!("Unable to contact object storage: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ListKeysPayload =
            response
                .json()
                .await
                .map_err(|error| StorageError::Provider {
                    message: format!("Invalid object storage response payload: {error}"),
                })?;
        Ok(payload.keys)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct UnavailableObjectStore {
    message: String,
}

#[async_trait]
impl ObjectStore for UnavailableObjectStore {
    async fn put_object(
        &self,
        _key: &str,
        _body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        Err(StorageError::Provider {
            message: self.message.clone(),
        })
    }

    async fn get_object(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Err(StorageError::Provider {
            message: self.message.clone(),
        })
    }

    async fn delete_object(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Provider {
            message: self.message.clone(),
        })
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[derive(Debug, Clone)]
struct MemoryObject {
    content_type: String,
    body: Vec<u8>,
}

/// In-memory object store used by tests and local development. A sorted map
/// keeps prefix listings ordered the way a real bucket listing would be.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, MemoryObject>>>,
}

impl MemoryObjectStore {
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn content_type_of(&self, key: &str) -> Option<String> {
        let objects = self.objects.read().await;
        objects.get(key).map(|object| object.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if !valid_object_key(key) {
            return Err(StorageError::Validation {
                message: format!("Invalid object key: {key}"),
            });
        }

        let mut objects = self.objects.write().await;
        objects.insert(
            key.to_string(),
            MemoryObject {
                content_type: content_type.to_string(),
                body,
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|object| object.body.clone()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        objects.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_reject_traversal_and_empty_segments() {
        assert!(valid_object_key("query-builder/2023-05-04T05:30:00/extension.js"));
        assert!(valid_object_key("markdown/docs/query.md"));
        assert!(!valid_object_key("/leading"));
        assert!(!valid_object_key("trailing/"));
        assert!(!valid_object_key("a//b"));
        assert!(!valid_object_key("a/../b"));
        assert!(!valid_object_key(""));
    }

    #[tokio::test]
    async fn prefix_listing_only_returns_matching_keys() {
        let store = MemoryObjectStore::default();
        store
            .put_object("alpha/1/main.js", b"a".to_vec(), "text/javascript")
            .await
            .expect("put");
        store
            .put_object("alpha/2/main.js", b"b".to_vec(), "text/javascript")
            .await
            .expect("put");
        store
            .put_object("beta/1/main.js", b"c".to_vec(), "text/javascript")
            .await
            .expect("put");

        let keys = store.list_keys("alpha/").await.expect("list");
        assert_eq!(keys, vec!["alpha/1/main.js", "alpha/2/main.js"]);
    }

    #[tokio::test]
    async fn extension_versions_are_distinct_and_newest_first() {
        let store = MemoryObjectStore::default();
        for key in [
            "query-builder/2023-01-01T00:00:00/extension.js",
            "query-builder/2023-01-01T00:00:00/extension.css",
            "query-builder/2023-06-01T00:00:00/extension.js",
            "query-builder/2022-11-01T00:00:00/extension.js",
        ] {
            store
                .put_object(key, b"body".to_vec(), "text/javascript")
                .await
                .expect("put");
        }

        let versions = list_extension_versions(&store, "query-builder")
            .await
            .expect("versions");
        assert_eq!(
            versions,
            vec![
                "2023-06-01T00:00:00",
                "2023-01-01T00:00:00",
                "2022-11-01T00:00:00",
            ]
        );
    }
}
