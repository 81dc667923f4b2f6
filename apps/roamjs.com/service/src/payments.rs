use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use uuid::Uuid;

use roamjs_payments_client::{PaymentsApiClient, PaymentsApiConfig, PaymentsApiError};

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum PaymentsError {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Conflict { message: String },
    #[error("{message}")]
    Provider { message: String },
    #[error("payments provider request failed ({status}): {body}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct ServicePrice {
    pub id: String,
    pub unit_amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutRedirect {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    pub id: String,
    pub status: String,
}

/// One adapter call per provider call; no retries, no backoff.
#[async_trait]
pub trait PaymentsProvider: Send + Sync {
    async fn price_for_service(&self, service: &str)
    -> Result<Option<ServicePrice>, PaymentsError>;

    async fn ensure_customer(&self, email: &str) -> Result<String, PaymentsError>;

    async fn has_default_payment_method(&self, customer_id: &str)
    -> Result<bool, PaymentsError>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &[(String, String)],
    ) -> Result<SubscriptionHandle, PaymentsError>;

    async fn active_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> Result<Option<SubscriptionHandle>, PaymentsError>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionHandle, PaymentsError>;

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        success_url: &str,
        cancel_url: &str,
        metadata: &[(String, String)],
    ) -> Result<CheckoutRedirect, PaymentsError>;

    async fn create_charge(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> Result<ChargeReceipt, PaymentsError>;

    fn name(&self) -> &'static str;
}

pub fn provider_from_config(config: &Config) -> Arc<dyn PaymentsProvider> {
    if config.provider_mode == "mock" {
        return Arc::new(MockPaymentsProvider::default());
    }

    let Some(secret_key) = config.payments_secret_key.as_ref() else {
        return Arc::new(UnavailablePaymentsProvider {
            message: "Payments provider credentials are not configured.".to_string(),
        });
    };

    let mut client_config = PaymentsApiConfig::new(secret_key.clone());
    client_config.base_url = config.payments_api_base_url.clone();

    match PaymentsApiClient::new(client_config) {
        Ok(client) => Arc::new(StripePaymentsProvider { client }),
        Err(error) => Arc::new(UnavailablePaymentsProvider {
            message: format!("Payments client could not be constructed: {error}"),
        }),
    }
}

fn map_client_error(error: PaymentsApiError) -> PaymentsError {
    match error {
        PaymentsApiError::Http { status, body } => PaymentsError::Upstream {
            status: status.as_u16(),
            body,
        },
        other => PaymentsError::Provider {
            message: other.to_string(),
        },
    }
}

struct StripePaymentsProvider {
    client: PaymentsApiClient,
}

#[async_trait]
impl PaymentsProvider for StripePaymentsProvider {
    async fn price_for_service(
        &self,
        service: &str,
    ) -> Result<Option<ServicePrice>, PaymentsError> {
        let prices = self
            .client
            .list_prices_for_product(service)
            .await
            .map_err(map_client_error)?;

        Ok(prices.data.into_iter().next().map(|price| ServicePrice {
            id: price.id,
            unit_amount: price.unit_amount.unwrap_or_default(),
            currency: price.currency,
        }))
    }

    async fn ensure_customer(&self, email: &str) -> Result<String, PaymentsError> {
        let existing = self
            .client
            .customers_by_email(email)
            .await
            .map_err(map_client_error)?;

        if let Some(customer) = existing.data.into_iter().next() {
            return Ok(customer.id);
        }

        let created = self
            .client
            .create_customer(email)
            .await
            .map_err(map_client_error)?;
        Ok(created.id)
    }

    async fn has_default_payment_method(
        &self,
        customer_id: &str,
    ) -> Result<bool, PaymentsError> {
        let customer = self
            .client
            .customer(customer_id)
            .await
            .map_err(map_client_error)?;

        if customer
            .invoice_settings
            .unwrap_or_default()
            .default_payment_method
            .is_some()
        {
            return Ok(true);
        }

        let methods = self
            .client
            .card_payment_methods(customer_id)
            .await
            .map_err(map_client_error)?;
        Ok(!methods.data.is_empty())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &[(String, String)],
    ) -> Result<SubscriptionHandle, PaymentsError> {
        let subscription = self
            .client
            .create_subscription(customer_id, price_id, metadata)
            .await
            .map_err(map_client_error)?;

        Ok(SubscriptionHandle {
            id: subscription.id,
            status: subscription.status,
        })
    }

    async fn active_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> Result<Option<SubscriptionHandle>, PaymentsError> {
        let subscriptions = self
            .client
            .subscriptions_for_customer(customer_id, price_id)
            .await
            .map_err(map_client_error)?;

        Ok(subscriptions
            .data
            .into_iter()
            .next()
            .map(|subscription| SubscriptionHandle {
                id: subscription.id,
                status: subscription.status,
            }))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionHandle, PaymentsError> {
        let subscription = self
            .client
            .cancel_subscription(subscription_id)
            .await
            .map_err(map_client_error)?;

        Ok(SubscriptionHandle {
            id: subscription.id,
            status: subscription.status,
        })
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        success_url: &str,
        cancel_url: &str,
        metadata: &[(String, String)],
    ) -> Result<CheckoutRedirect, PaymentsError> {
        let session = self
            .client
            .create_checkout_session(
                customer_id,
                price_id,
                quantity,
                success_url,
                cancel_url,
                metadata,
            )
            .await
            .map_err(map_client_error)?;

        Ok(CheckoutRedirect {
            session_id: session.id,
            url: session.url,
        })
    }

    async fn create_charge(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> Result<ChargeReceipt, PaymentsError> {
        let intent = self
            .client
            .create_payment_intent(customer_id, amount, currency, description)
            .await
            .map_err(map_client_error)?;

        Ok(ChargeReceipt {
            id: intent.id,
            status: intent.status,
        })
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}

struct UnavailablePaymentsProvider {
    message: String,
}

#[async_trait]
impl PaymentsProvider for UnavailablePaymentsProvider {
    async fn price_for_service(
        &self,
        _service: &str,
    ) -> Result<Option<ServicePrice>, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn ensure_customer(&self, _email: &str) -> Result<String, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn has_default_payment_method(
        &self,
        _customer_id: &str,
    ) -> Result<bool, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn create_subscription(
        &self,
        _customer_id: &str,
        _price_id: &str,
        _metadata: &[(String, String)],
    ) -> Result<SubscriptionHandle, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn active_subscription(
        &self,
        _customer_id: &str,
        _price_id: &str,
    ) -> Result<Option<SubscriptionHandle>, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn cancel_subscription(
        &self,
        _subscription_id: &str,
    ) -> Result<SubscriptionHandle, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn create_checkout_session(
        &self,
        _customer_id: &str,
        _price_id: &str,
        _quantity: u64,
        _success_url: &str,
        _cancel_url: &str,
        _metadata: &[(String, String)],
    ) -> Result<CheckoutRedirect, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    async fn create_charge(
        &self,
        _customer_id: &str,
        _amount: i64,
        _currency: &str,
        _description: &str,
    ) -> Result<ChargeReceipt, PaymentsError> {
        Err(PaymentsError::Provider {
            message: self.message.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}

#[derive(Debug, Clone)]
struct MockSubscription {
    id: String,
    customer_id: String,
    price_id: String,
    status: String,
}

#[derive(Debug, Clone)]
pub struct RecordedCheckoutSession {
    pub session_id: String,
    pub customer_id: String,
    pub price_id: String,
    pub metadata: Vec<(String, String)>,
}

#[derive(Default)]
struct MockPaymentsState {
    prices: HashMap<String, ServicePrice>,
    customers: HashMap<String, String>,
    payment_methods: HashSet<String>,
    subscriptions: HashMap<String, MockSubscription>,
    checkout_sessions: Vec<RecordedCheckoutSession>,
    charges: Vec<ChargeReceipt>,
}

/// In-memory payments provider used by tests and local development.
#[derive(Clone, Default)]
pub struct MockPaymentsProvider {
    state: Arc<RwLock<MockPaymentsState>>,
}

impl MockPaymentsProvider {
    pub async fn insert_price(&self, service: &str, unit_amount: i64) -> ServicePrice {
        let price = ServicePrice {
            id: format!("price_{}", Uuid::new_v4().simple()),
            unit_amount,
            currency: "usd".to_string(),
        };

        let mut state = self.state.write().await;
        state.prices.insert(service.to_string(), price.clone());
        price
    }

    pub async fn seed_customer(&self, email: &str, payment_method_on_file: bool) -> String {
        let customer_id = format!("cus_{}", Uuid::new_v4().simple());
        let mut state = self.state.write().await;
        state
            .customers
            .insert(email.trim().to_lowercase(), customer_id.clone());
        if payment_method_on_file {
            state.payment_methods.insert(customer_id.clone());
        }
        customer_id
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    pub async fn checkout_sessions(&self) -> Vec<RecordedCheckoutSession> {
        self.state.read().await.checkout_sessions.clone()
    }

    pub async fn charge_count(&self) -> usize {
        self.state.read().await.charges.len()
    }
}

#[async_trait]
impl PaymentsProvider for MockPaymentsProvider {
    async fn price_for_service(
        &self,
        service: &str,
    ) -> Result<Option<ServicePrice>, PaymentsError> {
        let state = self.state.read().await;
        Ok(state.prices.get(service).cloned())
    }

    async fn ensure_customer(&self, email: &str) -> Result<String, PaymentsError> {
        let normalized = email.trim().to_lowercase();
        let mut state = self.state.write().await;
        if let Some(existing) = state.customers.get(&normalized) {
            return Ok(existing.clone());
        }

        let customer_id = format!("cus_{}", Uuid::new_v4().simple());
        state.customers.insert(normalized, customer_id.clone());
        Ok(customer_id)
    }

    async fn has_default_payment_method(
        &self,
        customer_id: &str,
    ) -> Result<bool, PaymentsError> {
        let state = self.state.read().await;
        Ok(state.payment_methods.contains(customer_id))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        _metadata: &[(String, String)],
    ) -> Result<SubscriptionHandle, PaymentsError> {
        let subscription = MockSubscription {
            id: format!("sub_{}", Uuid::new_v4().simple()),
            customer_id: customer_id.to_string(),
            price_id: price_id.to_string(),
            status: "active".to_string(),
        };

        let mut state = self.state.write().await;
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());

        Ok(SubscriptionHandle {
            id: subscription.id,
            status: subscription.status,
        })
    }

    async fn active_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> Result<Option<SubscriptionHandle>, PaymentsError> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .find(|subscription| {
                subscription.customer_id == customer_id
                    && subscription.price_id == price_id
                    && subscription.status == "active"
            })
            .map(|subscription| SubscriptionHandle {
                id: subscription.id.clone(),
                status: subscription.status.clone(),
            }))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionHandle, PaymentsError> {
        let mut state = self.state.write().await;
        let Some(subscription) = state.subscriptions.get_mut(subscription_id) else {
            return Err(PaymentsError::Conflict {
                message: "Subscription is already canceled.".to_string(),
            });
        };

        if subscription.status != "active" {
            return Err(PaymentsError::Conflict {
                message: "Subscription is already canceled.".to_string(),
            });
        }

        subscription.status = "canceled".to_string();
        Ok(SubscriptionHandle {
            id: subscription.id.clone(),
            status: subscription.status.clone(),
        })
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        _quantity: u64,
        _success_url: &str,
        _cancel_url: &str,
        metadata: &[(String, String)],
    ) -> Result<CheckoutRedirect, PaymentsError> {
        let session_id = format!("cs_test_{}", Uuid::new_v4().simple());

        let mut state = self.state.write().await;
        state.checkout_sessions.push(RecordedCheckoutSession {
            session_id: session_id.clone(),
            customer_id: customer_id.to_string(),
            price_id: price_id.to_string(),
            metadata: metadata.to_vec(),
        });

        Ok(CheckoutRedirect {
            url: Some(format!("https://checkout.example.com/{session_id}")),
            session_id,
        })
    }

    async fn create_charge(
        &self,
        _customer_id: &str,
        amount: i64,
        _currency: &str,
        _description: &str,
    ) -> Result<ChargeReceipt, PaymentsError> {
        if amount <= 0 {
            return Err(PaymentsError::Validation {
                message: "Charge amount must be greater than 0.".to_string(),
            });
        }

        let receipt = ChargeReceipt {
            id: format!("pi_{}", Uuid::new_v4().simple()),
            status: "succeeded".to_string(),
        };

        let mut state = self.state.write().await;
        state.charges.push(receipt.clone());
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook secret is not configured")]
    NotConfigured,
    #[error("invalid signature header")]
    InvalidHeader,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies the payments provider's `t=...,v1=...` webhook signature scheme:
/// HMAC-SHA256 over `"{timestamp}.{payload}"` with a tolerance window on the
/// timestamp. `verify_slice` keeps the digest comparison constant-time.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret: config.payments_webhook_secret.clone(),
            tolerance: Duration::seconds(config.payments_webhook_tolerance_seconds as i64),
        }
    }

    pub fn verify(&self, signature_header: &str, payload: &[u8]) -> Result<(), WebhookError> {
        self.verify_at(signature_header, payload, Utc::now().timestamp())
    }

    fn verify_at(
        &self,
        signature_header: &str,
        payload: &[u8],
        now_unix: i64,
    ) -> Result<(), WebhookError> {
        let secret = self.secret.as_ref().ok_or(WebhookError::NotConfigured)?;

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature_header.split(',') {
            let mut pieces = part.trim().splitn(2, '=');
            match (pieces.next(), pieces.next()) {
                (Some("t"), Some(value)) => {
                    timestamp = value.trim().parse::<i64>().ok();
                }
                (Some("v1"), Some(value)) => {
                    if let Ok(decoded) = hex::decode(value.trim()) {
                        candidates.push(decoded);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(WebhookError::InvalidHeader)?;
        if candidates.is_empty() {
            return Err(WebhookError::InvalidHeader);
        }

        if (now_unix - timestamp).abs() > self.tolerance.num_seconds() {
            return Err(WebhookError::Expired);
        }

        for candidate in candidates {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|_| WebhookError::NotConfigured)?;
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            if mac.verify_slice(&candidate).is_ok() {
                return Ok(());
            }
        }

        Err(WebhookError::Mismatch)
    }
}

/// Produces a header the verifier accepts; used by tests and local tooling.
pub fn sign_webhook_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={signature}")
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(secret: &str) -> WebhookVerifier {
        WebhookVerifier {
            secret: Some(secret.to_string()),
            tolerance: Duration::seconds(300),
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let secret = "whsec_test";
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign_webhook_payload(secret, 1_700_000_000, payload);

        assert!(
            verifier(secret)
                .verify_at(&header, payload, 1_700_000_030)
                .is_ok()
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = "whsec_test";
        let header = sign_webhook_payload(secret, 1_700_000_000, b"original");

        let result = verifier(secret).verify_at(&header, b"tampered", 1_700_000_030);
        assert!(matches!(result, Err(WebhookError::Mismatch)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let secret = "whsec_test";
        let payload = b"payload";
        let header = sign_webhook_payload(secret, 1_700_000_000, payload);

        let result = verifier(secret).verify_at(&header, payload, 1_700_000_000 + 301);
        assert!(matches!(result, Err(WebhookError::Expired)));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let result = verifier("whsec_test").verify_at("v1=zz", b"payload", 0);
        assert!(matches!(result, Err(WebhookError::InvalidHeader)));
    }

    #[tokio::test]
    async fn double_cancel_is_a_conflict() {
        let provider = MockPaymentsProvider::default();
        let customer = provider.seed_customer("dev@roamjs.test", true).await;
        let subscription = provider
            .create_subscription(&customer, "price_test", &[])
            .await
            .expect("subscription created");

        provider
            .cancel_subscription(&subscription.id)
            .await
            .expect("first cancel succeeds");

        let second = provider.cancel_subscription(&subscription.id).await;
        assert!(matches!(second, Err(PaymentsError::Conflict { .. })));
    }
}
