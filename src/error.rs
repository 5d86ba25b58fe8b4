//! API error taxonomy and the JSON error envelope.
//!
//! Every handler returns `Result<_, ApiError>`. Each variant maps to one HTTP
//! status and one stable `code` string; the `message` sent to clients is
//! generic for authentication and internal failures, while the full cause is
//! logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Generic message for any 5xx the client should not learn details about.
const INTERNAL_MESSAGE: &str = "Internal server error";

/// Message returned for both unknown-email and wrong-password logins.
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid email or password";

#[derive(Error, Debug)]
pub enum ApiError {
    // ─── Input ───
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Request body too large")]
    PayloadTooLarge,

    // ─── Authentication / authorization ───
    #[error("Authentication required")]
    AuthMissing,

    #[error("Session expired")]
    AuthExpired,

    #[error("Invalid token: {0}")]
    AuthInvalid(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Insufficient role: required one of [{required}]")]
    Forbidden { required: String },

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    // ─── Infrastructure ───
    #[error("Request timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire shape of every API error.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::AuthMissing
            | Self::AuthExpired
            | Self::AuthInvalid(_)
            | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::PayloadTooLarge => "payload_too_large",
            Self::AuthMissing => "auth_missing",
            Self::AuthExpired => "auth_expired",
            Self::AuthInvalid(_) => "auth_invalid",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Upstream(_) => "upstream",
            Self::Configuration(_) | Self::Internal(_) => "internal",
        }
    }

    /// Client-facing message. Token and server failures never leak their cause.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::Conflict(msg) | Self::NotFound(msg) => msg.clone(),
            Self::MethodNotAllowed => "Method not allowed for this path".into(),
            Self::PayloadTooLarge => "Request body too large".into(),
            Self::AuthMissing => "Authentication required".into(),
            Self::AuthExpired => "Session expired, please log in again".into(),
            Self::AuthInvalid(_) => "Invalid or malformed token".into(),
            Self::InvalidCredentials => INVALID_CREDENTIALS_MESSAGE.into(),
            Self::Forbidden { .. } => "You do not have permission to perform this action".into(),
            Self::RateLimited { .. } => "Too many requests, please retry later".into(),
            Self::Timeout => "Request timed out".into(),
            Self::Upstream(_) => "The assistant is temporarily unavailable".into(),
            Self::Configuration(_) | Self::Internal(_) => INTERNAL_MESSAGE.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Error for a status produced outside any handler (router fallback,
    /// body limit, timeout layer). `None` for statuses handlers own.
    pub fn from_bare_status(status: StatusCode) -> Option<Self> {
        match status {
            StatusCode::NOT_FOUND => Some(Self::NotFound("Not found".into())),
            StatusCode::METHOD_NOT_ALLOWED => Some(Self::MethodNotAllowed),
            StatusCode::PAYLOAD_TOO_LARGE => Some(Self::PayloadTooLarge),
            StatusCode::REQUEST_TIMEOUT => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Configuration(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "request failed");
            }
            Self::Upstream(_) => tracing::warn!(error = %self, "upstream failure"),
            Self::Timeout => tracing::warn!("request timed out"),
            Self::AuthInvalid(_) | Self::AuthExpired | Self::Forbidden { .. } => {
                tracing::debug!(error = %self, "request rejected");
            }
            _ => {}
        }

        let body = ErrorBody {
            message: self.public_message(),
            code: self.code(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(format!("database: {err}"))
    }
}

impl From<crate::auth::store::StoreError> for ApiError {
    fn from(err: crate::auth::store::StoreError) -> Self {
        use crate::auth::store::StoreError;
        match err {
            StoreError::Duplicate(field) => Self::Conflict(format!("{field} already in use")),
            StoreError::UnknownRole(role) => Self::NotFound(format!("Role '{role}' not found")),
            StoreError::UnknownAccount(id) => Self::NotFound(format!("Account {id} not found")),
            StoreError::Database(e) => Self::from(e),
        }
    }
}

/// Result alias used by services and handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn auth_failures_are_unauthorized_but_distinguishable() {
        let errs = [
            ApiError::AuthMissing,
            ApiError::AuthExpired,
            ApiError::AuthInvalid("bad sig".into()),
        ];
        let codes: Vec<_> = errs.iter().map(ApiError::code).collect();
        assert!(errs.iter().all(|e| e.status() == StatusCode::UNAUTHORIZED));
        assert_eq!(codes, ["auth_missing", "auth_expired", "auth_invalid"]);
    }

    #[test]
    fn forbidden_is_not_unauthorized() {
        let err = ApiError::Forbidden {
            required: "admin".into(),
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn internal_error_hides_cause() {
        let (status, body) = body_json(ApiError::Internal("disk on fire at /var/db".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], INTERNAL_MESSAGE);
        assert!(!body.to_string().contains("/var/db"));
    }

    #[tokio::test]
    async fn invalid_token_hides_decoder_detail() {
        let (_, body) = body_json(ApiError::AuthInvalid("InvalidSignature".into())).await;
        assert_eq!(body["code"], "auth_invalid");
        assert!(!body["message"]
            .as_str()
            .unwrap()
            .contains("InvalidSignature"));
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_secs: 60,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[axum::http::header::RETRY_AFTER], "60");
    }

    #[tokio::test]
    async fn layer_statuses_get_their_own_codes() {
        for (status, code) in [
            (StatusCode::NOT_FOUND, "not_found"),
            (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
            (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            (StatusCode::REQUEST_TIMEOUT, "timeout"),
        ] {
            let err = ApiError::from_bare_status(status).unwrap();
            let (got, body) = body_json(err).await;
            assert_eq!(got, status);
            assert_eq!(body["code"], code);
        }
        let handler_owned = ApiError::from_bare_status(StatusCode::BAD_REQUEST);
        assert!(handler_owned.is_none());
    }

    #[test]
    fn duplicate_store_error_maps_to_conflict() {
        let err: ApiError =
            crate::auth::store::StoreError::Duplicate(crate::auth::store::UniqueField::Email)
                .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.public_message(), "email already in use");
    }
}
