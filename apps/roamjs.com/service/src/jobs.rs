use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("job invocation failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

/// Invoke-by-name background job dispatch. The call returns once the job
/// runner has accepted the submission; completion arrives later through the
/// job's callback, never through this interface.
#[async_trait]
pub trait JobInvoker: Send + Sync {
    async fn invoke(&self, job_name: &str, payload: Value) -> Result<(), JobError>;

    fn name(&self) -> &'static str;
}

pub fn invoker_from_config(config: &Config) -> Arc<dyn JobInvoker> {
    if config.provider_mode == "mock" {
        return Arc::new(RecordingJobInvoker::default());
    }

    match config.jobs_base_url.as_ref() {
        Some(base_url) => Arc::new(HttpJobInvoker {
            base_url: base_url.clone(),
            api_key: config.jobs_api_key.clone(),
            http: reqwest::Client::new(),
        }),
        None => Arc::new(UnavailableJobInvoker {
            message: "Background job runner is not configured.".to_string(),
        }),
    }
}

fn valid_job_name(job_name: &str) -> bool {
    !job_name.is_empty()
        && job_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Clone)]
struct HttpJobInvoker {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[async_trait]
impl JobInvoker for HttpJobInvoker {
    async fn invoke(&self, job_name: &str, payload: Value) -> Result<(), JobError> {
        if !valid_job_name(job_name) {
            return Err(JobError::Validation {
                message: format!("Invalid job name: {job_name}"),
            });
        }

        let url = format!("{}/jobs/{job_name}", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(url).json(&payload);
        if let Some(api_key) = self.api_key.as_ref() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| JobError::Provider {
            message: format!("Unable to contact job runner: {error}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JobError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct UnavailableJobInvoker {
    message: String,
}

#[async_trait]
impl JobInvoker for UnavailableJobInvoker {
    async fn invoke(&self, _job_name: &str, _payload: Value) -> Result<(), JobError> {
        Err(JobError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub job_name: String,
    pub payload: Value,
}

/// Records invocations instead of dispatching them; used by tests and local
/// development.
#[derive(Clone, Default)]
pub struct RecordingJobInvoker {
    invocations: Arc<Mutex<Vec<RecordedInvocation>>>,
}

impl RecordingJobInvoker {
    pub async fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().await.clone()
    }
}

#[async_trait]
impl JobInvoker for RecordingJobInvoker {
    async fn invoke(&self, job_name: &str, payload: Value) -> Result<(), JobError> {
        if !valid_job_name(job_name) {
            return Err(JobError::Validation {
                message: format!("Invalid job name: {job_name}"),
            });
        }

        let mut invocations = self.invocations.lock().await;
        invocations.push(RecordedInvocation {
            job_name: job_name.to_string(),
            payload,
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_kebab_case() {
        assert!(valid_job_name("launch-website"));
        assert!(valid_job_name("deploy-website"));
        assert!(!valid_job_name("Launch Website"));
        assert!(!valid_job_name("jobs/../other"));
        assert!(!valid_job_name(""));
    }

    #[tokio::test]
    async fn recording_invoker_captures_payloads() {
        let invoker = RecordingJobInvoker::default();
        invoker
            .invoke(
                "launch-website",
                serde_json::json!({"graph": "dev-graph"}),
            )
            .await
            .expect("invoke records");

        let recorded = invoker.invocations().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].job_name, "launch-website");
        assert_eq!(recorded[0].payload["graph"], "dev-graph");
    }
}
