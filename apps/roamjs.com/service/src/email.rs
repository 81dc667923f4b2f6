use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("{message}")]
    Provider { message: String },
    #[error("email send failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), EmailError>;

    fn name(&self) -> &'static str;
}

pub fn sender_from_config(config: &Config) -> Arc<dyn EmailSender> {
    if config.provider_mode == "mock" {
        return Arc::new(RecordingEmailSender::default());
    }

    match config.email_api_key.as_ref() {
        Some(api_key) => Arc::new(ResendEmailSender {
            base_url: config.email_api_base_url.clone(),
            api_key: api_key.clone(),
            from: config.email_from.clone(),
            http: reqwest::Client::new(),
        }),
        None => Arc::new(UnavailableEmailSender {
            message: "Email provider credentials are not configured.".to_string(),
        }),
    }
}

/// Best-effort operator side channel for unexpected server errors. A failed
/// report is logged and swallowed; it never changes the caller's response.
pub fn report_operator_error(
    sender: Arc<dyn EmailSender>,
    operator_email: String,
    context: &'static str,
    detail: String,
) {
    tokio::spawn(async move {
        let subject = format!("RoamJS error: {context}");
        let body = format!("<p>{detail}</p>");
        if let Err(error) = sender.send(&operator_email, &subject, &body).await {
            tracing::warn!(
                target: "roamjs.email",
                context,
                error = %error,
                "failed to deliver operator error report",
            );
        }
    });
}

#[derive(Debug, Clone)]
struct ResendEmailSender {
    base_url: String,
    api_key: String,
    from: String,
    http: reqwest::Client,
}

#[async_trait]
impl EmailSender for ResendEmailSender {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), EmailError> {
        let url = format!("{}/emails", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "html": body_html,
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| EmailError::Provider {
                message: format!("Unable to contact email provider: {error}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

struct UnavailableEmailSender {
    message: String,
}

#[async_trait]
impl EmailSender for UnavailableEmailSender {
    async fn send(&self, _to: &str, _subject: &str, _body_html: &str) -> Result<(), EmailError> {
        Err(EmailError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

#[derive(Debug, Clone)]
pub struct RecordedEmail {
    pub to: String,
    pub subject: String,
    pub body_html: String,
}

#[derive(Clone, Default)]
pub struct RecordingEmailSender {
    sent: Arc<Mutex<Vec<RecordedEmail>>>,
}

impl RecordingEmailSender {
    pub async fn sent(&self) -> Vec<RecordedEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), EmailError> {
        let mut sent = self.sent.lock().await;
        sent.push(RecordedEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
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

    #[tokio::test]
    async fn recording_sender_captures_messages() {
        let sender = RecordingEmailSender::default();
        sender
            .send("dev@roamjs.test", "Welcome to RoamJS", "<p>hi</p>")
            .await
            .expect("send records");

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Welcome to RoamJS");
    }
}
