use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "https://api.stripe.com";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct PaymentsApiConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout_ms: u64,
}

impl PaymentsApiConfig {
    #[must_use]
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            secret_key: secret_key.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentsApiClient {
    base_url: String,
    secret_key: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum PaymentsApiError {
    #[error("payments_client_base_url_missing")]
    BaseUrlMissing,
    #[error("payments_client_secret_key_missing")]
    SecretKeyMissing,
    #[error("payments_client_invalid_path")]
    InvalidPath,
    #[error("payments_request_failed:{message}")]
    Request { message: String },
    #[error("payments_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("payments_json_decode_failed:{message}")]
    Decode { message: String },
}

impl PaymentsApiError {
    /// Upstream HTTP status carried by the error, when the provider answered.
    #[must_use]
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(status.as_u16()),
            _ => None,
        }
    }

    /// Raw upstream error body, when the provider answered.
    #[must_use]
    pub fn upstream_body(&self) -> Option<&str> {
        match self {
            Self::Http { body, .. } => Some(body.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub id: String,
    pub product: String,
    pub currency: String,
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub recurring: Option<PriceRecurrence>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRecurrence {
    pub interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub invoice_settings: Option<CustomerInvoiceSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerInvoiceSettings {
    #[serde(default)]
    pub default_payment_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    pub customer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl PaymentsApiClient {
    pub fn new(config: PaymentsApiConfig) -> Result<Self, PaymentsApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let secret_key = config.secret_key.trim().to_string();
        if secret_key.is_empty() {
            return Err(PaymentsApiError::SecretKeyMissing);
        }

        Ok(Self {
            base_url,
            secret_key,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    pub async fn list_prices_for_product(
        &self,
        product: &str,
    ) -> Result<ApiList<Price>, PaymentsApiError> {
        self.get_json("/v1/prices", &[("product", product), ("active", "true")])
            .await
    }

    pub async fn customers_by_email(
        &self,
        email: &str,
    ) -> Result<ApiList<Customer>, PaymentsApiError> {
        self.get_json("/v1/customers", &[("email", email)]).await
    }

    pub async fn create_customer(&self, email: &str) -> Result<Customer, PaymentsApiError> {
        self.post_form("/v1/customers", &[("email".to_string(), email.to_string())])
            .await
    }

    pub async fn customer(&self, customer_id: &str) -> Result<Customer, PaymentsApiError> {
        self.get_json(&format!("/v1/customers/{customer_id}"), &[])
            .await
    }

    pub async fn card_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<ApiList<PaymentMethod>, PaymentsApiError> {
        self.get_json(
            "/v1/payment_methods",
            &[("customer", customer_id), ("type", "card")],
        )
        .await
    }

    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &[(String, String)],
    ) -> Result<Subscription, PaymentsApiError> {
        let mut form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
        ];
        form.extend(metadata_form_entries(metadata));
        self.post_form("/v1/subscriptions", &form).await
    }

    pub async fn subscriptions_for_customer(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> Result<ApiList<Subscription>, PaymentsApiError> {
        self.get_json(
            "/v1/subscriptions",
            &[
                ("customer", customer_id),
                ("price", price_id),
                ("status", "active"),
            ],
        )
        .await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, PaymentsApiError> {
        let url = self
            .endpoint(&format!("/v1/subscriptions/{subscription_id}"))
            .ok_or(PaymentsApiError::InvalidPath)?;

        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.secret_key)
            .header("x-request-id", request_id())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| PaymentsApiError::Request {
                message: error.to_string(),
            })?;

        decode_json_response(response).await
    }

    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        success_url: &str,
        cancel_url: &str,
        metadata: &[(String, String)],
    ) -> Result<CheckoutSession, PaymentsApiError> {
        let mut form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), customer_id.to_string()),
            ("line_items[0][price]".to_string(), price_id.to_string()),
            ("line_items[0][quantity]".to_string(), quantity.to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("cancel_url".to_string(), cancel_url.to_string()),
        ];
        form.extend(metadata_form_entries(metadata));
        self.post_form("/v1/checkout/sessions", &form).await
    }

    pub async fn create_payment_intent(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> Result<PaymentIntent, PaymentsApiError> {
        self.post_form(
            "/v1/payment_intents",
            &[
                ("customer".to_string(), customer_id.to_string()),
                ("amount".to_string(), amount.to_string()),
                ("currency".to_string(), currency.to_string()),
                ("description".to_string(), description.to_string()),
                ("confirm".to_string(), "true".to_string()),
                ("off_session".to_string(), "true".to_string()),
            ],
        )
        .await
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, PaymentsApiError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(PaymentsApiError::InvalidPath)?;

        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(&self.secret_key)
            .header("x-request-id", request_id())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| PaymentsApiError::Request {
                message: error.to_string(),
            })?;

        decode_json_response(response).await
    }

    async fn post_form<T>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, PaymentsApiError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(PaymentsApiError::InvalidPath)?;

        let response = self
            .http
            .post(url)
            .form(form)
            .bearer_auth(&self.secret_key)
            .header("x-request-id", request_id())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| PaymentsApiError::Request {
                message: error.to_string(),
            })?;

        decode_json_response(response).await
    }
}

fn metadata_form_entries(metadata: &[(String, String)]) -> Vec<(String, String)> {
    metadata
        .iter()
        .map(|(key, value)| (format!("metadata[{key}]"), value.clone()))
        .collect()
}

fn request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

fn normalize_base_url(base_url: &str) -> Result<String, PaymentsApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(PaymentsApiError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, PaymentsApiError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|error| PaymentsApiError::Request {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        let body = String::from_utf8_lossy(&body).to_string();
        let body = if body.trim().is_empty() {
            "<empty>".to_string()
        } else {
            body
        };
        return Err(PaymentsApiError::Http { status, body });
    }

    serde_json::from_slice(&body).map_err(|error| PaymentsApiError::Decode {
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> PaymentsApiClient {
        let mut config = PaymentsApiConfig::new("sk_test_abc");
        config.base_url = "https://payments.example.com/".to_string();
        PaymentsApiClient::new(config).expect("payments client")
    }

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let client = test_client();

        assert_eq!(
            client.endpoint("/v1/prices"),
            Some("https://payments.example.com/v1/prices".to_string())
        );
        assert_eq!(
            client.endpoint("v1/prices"),
            Some("https://payments.example.com/v1/prices".to_string())
        );
        assert_eq!(client.endpoint(""), None);
    }

    #[test]
    fn client_requires_secret_key() {
        let config = PaymentsApiConfig::new("   ");
        assert!(matches!(
            PaymentsApiClient::new(config),
            Err(PaymentsApiError::SecretKeyMissing)
        ));
    }

    #[test]
    fn client_requires_base_url() {
        let mut config = PaymentsApiConfig::new("sk_test_abc");
        config.base_url = "  ".to_string();
        assert!(matches!(
            PaymentsApiClient::new(config),
            Err(PaymentsApiError::BaseUrlMissing)
        ));
    }

    #[test]
    fn metadata_entries_use_bracket_keys() {
        let entries = metadata_form_entries(&[
            ("user_id".to_string(), "user_1".to_string()),
            ("service".to_string(), "static-site".to_string()),
        ]);
        assert_eq!(
            entries,
            vec![
                ("metadata[user_id]".to_string(), "user_1".to_string()),
                ("metadata[service]".to_string(), "static-site".to_string()),
            ]
        );
    }

    #[test]
    fn upstream_status_is_exposed_for_http_errors() {
        let error = PaymentsApiError::Http {
            status: StatusCode::PAYMENT_REQUIRED,
            body: "{\"error\":{\"message\":\"card declined\"}}".to_string(),
        };
        assert_eq!(error.upstream_status(), Some(402));
        assert!(error.upstream_body().unwrap_or_default().contains("card"));
    }

    #[test]
    fn list_payload_decodes() {
        let payload = serde_json::json!({
            "data": [
                {
                    "id": "price_123",
                    "product": "prod_site",
                    "currency": "usd",
                    "unit_amount": 1200,
                    "recurring": {"interval": "month"},
                    "active": true
                }
            ],
            "has_more": false
        });

        let list: ApiList<Price> =
            serde_json::from_value(payload).expect("price list should decode");
        assert_eq!(list.data.len(), 1);
        assert_eq!(list.data[0].id, "price_123");
        assert_eq!(list.data[0].unit_amount, Some(1200));
    }
}
