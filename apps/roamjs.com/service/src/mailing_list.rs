use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum MailingListError {
    #[error("{message}")]
    Provider { message: String },
    #[error("mailing list subscribe failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

#[async_trait]
pub trait MailingList: Send + Sync {
    async fn subscribe(&self, email: &str) -> Result<(), MailingListError>;

    fn name(&self) -> &'static str;
}

pub fn list_from_config(config: &Config) -> Arc<dyn MailingList> {
    if config.provider_mode == "mock" {
        return Arc::new(RecordingMailingList::default());
    }

    match (
        config.mailing_list_api_key.as_ref(),
        config.mailing_list_form_id.as_ref(),
    ) {
        (Some(api_key), Some(form_id)) => Arc::new(ConvertKitMailingList {
            base_url: config.mailing_list_api_base_url.clone(),
            api_key: api_key.clone(),
            form_id: form_id.clone(),
            http: reqwest::Client::new(),
        }),
        _ => Arc::new(UnavailableMailingList {
            message: "Mailing list provider is not configured.".to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
struct ConvertKitMailingList {
    base_url: String,
    api_key: String,
    form_id: String,
    http: reqwest::Client,
}

#[async_trait]
impl MailingList for ConvertKitMailingList {
    async fn subscribe(&self, email: &str) -> Result<(), MailingListError> {
        let url = format!(
            "{}/forms/{}/subscribe",
            self.base_url.trim_end_matches('/'),
            self.form_id
        );
        let payload = serde_json::json!({
            "api_key": self.api_key,
            "email": email,
        });

        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| MailingListError::Provider {
                message: format!("Unable to contact mailing list provider: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailingListError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "convertkit"
    }
}

struct UnavailableMailingList {
    message: String,
}

#[async_trait]
impl MailingList for UnavailableMailingList {
    async fn subscribe(&self, _email: &str) -> Result<(), MailingListError> {
        Err(MailingListError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "convertkit"
    }
}

#[derive(Clone, Default)]
pub struct RecordingMailingList {
    subscribed: Arc<Mutex<Vec<String>>>,
}

impl RecordingMailingList {
    pub async fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().await.clone()
    }
}

#[async_trait]
impl MailingList for RecordingMailingList {
    async fn subscribe(&self, email: &str) -> Result<(), MailingListError> {
        let mut subscribed = self.subscribed.lock().await;
        subscribed.push(email.trim().to_lowercase());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
