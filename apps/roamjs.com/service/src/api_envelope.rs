use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Upstream,
    InternalError,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Upstream => "upstream_error",
            Self::InternalError => "internal_error",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Upstream => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub message: String,
    pub error: ApiErrorDetail,
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_status(code.default_status(), code, message)
}

pub fn error_response_with_status(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
) -> ApiErrorTuple {
    let message = message.into();
    (
        status,
        Json(ApiErrorResponse {
            message: message.clone(),
            error: ApiErrorDetail {
                code: code.as_str(),
                message,
            },
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::InvalidRequest, message)
}

pub fn unauthorized_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::Unauthorized, message)
}

pub fn forbidden_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::Forbidden, message)
}

pub fn not_found_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::NotFound, message)
}

pub fn conflict_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::Conflict, message)
}

pub fn internal_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::InternalError, message)
}

/// Surfaces an external provider's failure: its status code when it answered
/// (500 fallback otherwise) and its error body when one was available.
pub fn upstream_error(status: Option<u16>, body: Option<String>) -> ApiErrorTuple {
    let status = status
        .and_then(|value| StatusCode::from_u16(value).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = body
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "Upstream request failed.".to_string());

    error_response_with_status(status, ApiErrorCode::Upstream, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_bad_requests() {
        let (status, payload) = validation_error("Limit must be greater than 0");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["message"], "Limit must be greater than 0");
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[test]
    fn upstream_error_passes_provider_status_through() {
        let (status, payload) = upstream_error(Some(402), Some("card declined".to_string()));
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["message"], "card declined");
    }

    #[test]
    fn upstream_error_falls_back_to_500() {
        let (status, payload) = upstream_error(None, None);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["message"], "Upstream request failed.");
    }
}
