use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8484";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_PROVIDER_MODE: &str = "live";
const DEFAULT_IDENTITY_API_BASE_URL: &str = "https://api.clerk.com/v1";
const DEFAULT_PAYMENTS_API_BASE_URL: &str = "https://api.stripe.com";
const DEFAULT_PAYMENTS_WEBHOOK_TOLERANCE_SECONDS: u64 = 300;
const DEFAULT_EMAIL_API_BASE_URL: &str = "https://api.resend.com";
const DEFAULT_EMAIL_FROM: &str = "support@roamjs.com";
const DEFAULT_OPERATOR_EMAIL: &str = "support@roamjs.com";
const DEFAULT_MAILING_LIST_API_BASE_URL: &str = "https://api.convertkit.com/v3";
const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";
const DEFAULT_SOCIAL_API_BASE_URL: &str = "https://api.twitter.com";
const DEFAULT_SESSION_REQUEST_TTL_SECONDS: u64 = 600;
const DEFAULT_WORKFLOW_TTL_SECONDS: u64 = 86_400;
const DEFAULT_CHECKOUT_SUCCESS_URL: &str = "https://roamjs.com/checkout?success=true";
const DEFAULT_CHECKOUT_CANCEL_URL: &str = "https://roamjs.com/checkout?cancel=true";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub provider_mode: String,
    pub identity_api_base_url: String,
    pub identity_api_key: Option<String>,
    pub payments_api_base_url: String,
    pub payments_secret_key: Option<String>,
    pub payments_webhook_secret: Option<String>,
    pub payments_webhook_tolerance_seconds: u64,
    pub storage_base_url: Option<String>,
    pub storage_api_key: Option<String>,
    pub jobs_base_url: Option<String>,
    pub jobs_api_key: Option<String>,
    pub email_api_base_url: String,
    pub email_api_key: Option<String>,
    pub email_from: String,
    pub operator_email: String,
    pub mailing_list_api_base_url: String,
    pub mailing_list_api_key: Option<String>,
    pub mailing_list_form_id: Option<String>,
    pub github_api_base_url: String,
    pub github_token: Option<String>,
    pub social_api_base_url: String,
    pub social_client_id: Option<String>,
    pub social_client_secret: Option<String>,
    pub social_redirect_uri: Option<String>,
    pub session_request_ttl_seconds: u64,
    pub workflow_ttl_seconds: u64,
    pub workflow_store_path: Option<PathBuf>,
    pub status_store_path: Option<PathBuf>,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RJ_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("RJ_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("RJ_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let provider_mode = env::var("RJ_PROVIDER_MODE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDER_MODE.to_string())
            .trim()
            .to_lowercase();

        let identity_api_base_url = env::var("RJ_IDENTITY_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_IDENTITY_API_BASE_URL.to_string());

        let identity_api_key = env::var("RJ_IDENTITY_API_KEY")
            .ok()
            .or_else(|| env::var("CLERK_API_KEY").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let payments_api_base_url = env::var("RJ_PAYMENTS_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PAYMENTS_API_BASE_URL.to_string());

        let payments_secret_key = env::var("RJ_PAYMENTS_SECRET_KEY")
            .ok()
            .or_else(|| env::var("STRIPE_SECRET_KEY").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let payments_webhook_secret = env::var("RJ_PAYMENTS_WEBHOOK_SECRET")
            .ok()
            .or_else(|| env::var("STRIPE_WEBHOOK_SECRET").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let payments_webhook_tolerance_seconds = env::var("RJ_PAYMENTS_WEBHOOK_TOLERANCE_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PAYMENTS_WEBHOOK_TOLERANCE_SECONDS)
            .max(1);

        let storage_base_url = env::var("RJ_STORAGE_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());

        let storage_api_key = env::var("RJ_STORAGE_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let jobs_base_url = env::var("RJ_JOBS_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());

        let jobs_api_key = env::var("RJ_JOBS_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let email_api_base_url = env::var("RJ_EMAIL_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_EMAIL_API_BASE_URL.to_string());

        let email_api_key = env::var("RJ_EMAIL_API_KEY")
            .ok()
            .or_else(|| env::var("RESEND_API_KEY").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let email_from = env::var("RJ_EMAIL_FROM")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string());

        let operator_email = env::var("RJ_OPERATOR_EMAIL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OPERATOR_EMAIL.to_string());

        let mailing_list_api_base_url = env::var("RJ_MAILING_LIST_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MAILING_LIST_API_BASE_URL.to_string());

        let mailing_list_api_key = env::var("RJ_MAILING_LIST_API_KEY")
            .ok()
            .or_else(|| env::var("CONVERTKIT_API_KEY").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let mailing_list_form_id = env::var("RJ_MAILING_LIST_FORM_ID")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let github_api_base_url = env::var("RJ_GITHUB_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE_URL.to_string());

        let github_token = env::var("RJ_GITHUB_TOKEN")
            .ok()
            .or_else(|| env::var("GITHUB_TOKEN").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let social_api_base_url = env::var("RJ_SOCIAL_API_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SOCIAL_API_BASE_URL.to_string());

        let social_client_id = env::var("RJ_SOCIAL_CLIENT_ID")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let social_client_secret = env::var("RJ_SOCIAL_CLIENT_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let social_redirect_uri = env::var("RJ_SOCIAL_REDIRECT_URI")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let session_request_ttl_seconds = env::var("RJ_SESSION_REQUEST_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SESSION_REQUEST_TTL_SECONDS)
            .max(1);

        let workflow_ttl_seconds = env::var("RJ_WORKFLOW_TTL_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_WORKFLOW_TTL_SECONDS)
            .max(60);

        let workflow_store_path = env::var("RJ_WORKFLOW_STORE_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let status_store_path = env::var("RJ_STATUS_STORE_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let checkout_success_url = env::var("RJ_CHECKOUT_SUCCESS_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CHECKOUT_SUCCESS_URL.to_string());

        let checkout_cancel_url = env::var("RJ_CHECKOUT_CANCEL_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CHECKOUT_CANCEL_URL.to_string());

        Ok(Self {
            bind_addr,
            log_filter,
            provider_mode,
            identity_api_base_url,
            identity_api_key,
            payments_api_base_url,
            payments_secret_key,
            payments_webhook_secret,
            payments_webhook_tolerance_seconds,
            storage_base_url,
            storage_api_key,
            jobs_base_url,
            jobs_api_key,
            email_api_base_url,
            email_api_key,
            email_from,
            operator_email,
            mailing_list_api_base_url,
            mailing_list_api_key,
            mailing_list_form_id,
            github_api_base_url,
            github_token,
            social_api_base_url,
            social_client_id,
            social_client_secret,
            social_redirect_uri,
            session_request_ttl_seconds,
            workflow_ttl_seconds,
            workflow_store_path,
            status_store_path,
            checkout_success_url,
            checkout_cancel_url,
        })
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            provider_mode: "mock".to_string(),
            identity_api_base_url: DEFAULT_IDENTITY_API_BASE_URL.to_string(),
            identity_api_key: None,
            payments_api_base_url: DEFAULT_PAYMENTS_API_BASE_URL.to_string(),
            payments_secret_key: None,
            payments_webhook_secret: Some("whsec_test_secret".to_string()),
            payments_webhook_tolerance_seconds: DEFAULT_PAYMENTS_WEBHOOK_TOLERANCE_SECONDS,
            storage_base_url: None,
            storage_api_key: None,
            jobs_base_url: None,
            jobs_api_key: None,
            email_api_base_url: DEFAULT_EMAIL_API_BASE_URL.to_string(),
            email_api_key: None,
            email_from: DEFAULT_EMAIL_FROM.to_string(),
            operator_email: "ops@roamjs.test".to_string(),
            mailing_list_api_base_url: DEFAULT_MAILING_LIST_API_BASE_URL.to_string(),
            mailing_list_api_key: None,
            mailing_list_form_id: Some("form_test".to_string()),
            github_api_base_url: DEFAULT_GITHUB_API_BASE_URL.to_string(),
            github_token: None,
            social_api_base_url: DEFAULT_SOCIAL_API_BASE_URL.to_string(),
            social_client_id: None,
            social_client_secret: None,
            social_redirect_uri: None,
            session_request_ttl_seconds: DEFAULT_SESSION_REQUEST_TTL_SECONDS,
            workflow_ttl_seconds: DEFAULT_WORKFLOW_TTL_SECONDS,
            workflow_store_path: None,
            status_store_path: None,
            checkout_success_url: DEFAULT_CHECKOUT_SUCCESS_URL.to_string(),
            checkout_cancel_url: DEFAULT_CHECKOUT_CANCEL_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn test_fixture_uses_mock_providers() {
        let config = Config::for_tests();
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.provider_mode, "mock");
        assert!(config.payments_webhook_secret.is_some());
    }
}
