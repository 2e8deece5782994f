use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::db::store::StoreError;

/// Machine-readable error codes carried in every error envelope.
pub mod code {
    pub const SESSION_REQUIRED: &str = "SESSION_REQUIRED";
    pub const SESSION_INVALID: &str = "SESSION_INVALID";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const SESSION_REVOKED: &str = "SESSION_REVOKED";
    pub const ACCOUNT_DISABLED: &str = "ACCOUNT_DISABLED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const DUPLICATE_REQUEST: &str = "DUPLICATE_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    // Codes used by domain handlers through `GatewayError::Custom`.
    pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
}

const INTERNAL_MESSAGE: &str = "An internal error occurred";

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error payload embedded in response envelopes and HTTP error bodies.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}

/// HTTP error body: `{ "error": { code, message, details? } }`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ErrorBody,
}

/// Every failure the gateway can report to a client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication required")]
    SessionRequired,

    #[error("Session is invalid")]
    SessionInvalid,

    #[error("Session has expired")]
    SessionExpired,

    #[error("Session has been revoked")]
    SessionRevoked,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("You do not have permission to perform this action")]
    PermissionDenied,

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    RateLimited { message: String, retry_after_secs: u64 },

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Request {0} has already been processed on this connection")]
    DuplicateRequest(String),

    /// Domain-specific failure with its own stable code.
    #[error("{message}")]
    Custom {
        code: &'static str,
        message: String,
        details: Option<Value>,
    },

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionRequired => code::SESSION_REQUIRED,
            Self::SessionInvalid => code::SESSION_INVALID,
            Self::SessionExpired => code::SESSION_EXPIRED,
            Self::SessionRevoked => code::SESSION_REVOKED,
            Self::AccountDisabled => code::ACCOUNT_DISABLED,
            Self::PermissionDenied => code::PERMISSION_DENIED,
            Self::Forbidden(_) => code::FORBIDDEN,
            Self::RateLimited { .. } => code::RATE_LIMITED,
            Self::UnknownAction(_) => code::UNKNOWN_ACTION,
            Self::Validation(_) => code::VALIDATION_ERROR,
            Self::DuplicateRequest(_) => code::DUPLICATE_REQUEST,
            Self::Custom { code, .. } => code,
            Self::Internal(_) => code::INTERNAL_ERROR,
        }
    }

    /// Whether this error means the connection's bound session is no longer usable.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            Self::SessionInvalid | Self::SessionExpired | Self::SessionRevoked | Self::AccountDisabled
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::custom(code::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::custom(code::CONFLICT, message)
    }

    pub fn invalid_credentials() -> Self {
        Self::custom(code::INVALID_CREDENTIALS, "Invalid email or password")
    }

    pub fn custom(code: &'static str, message: impl Into<String>) -> Self {
        Self::Custom {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Build the wire error body.
    ///
    /// Internal messages are replaced with a generic one unless
    /// `expose_internal` is set (non-production diagnostics only).
    pub fn to_body(&self, expose_internal: bool) -> ErrorBody {
        let message = match self {
            Self::Internal(_) if !expose_internal => INTERNAL_MESSAGE.to_string(),
            other => other.to_string(),
        };

        let details = match self {
            Self::Validation(fields) => Some(serde_json::json!({ "fields": fields })),
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(serde_json::json!({ "retryAfterSecs": retry_after_secs })),
            Self::Custom { details, .. } => details.clone(),
            _ => None,
        };

        ErrorBody {
            code: self.code().to_string(),
            message,
            details,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::SessionRequired
            | Self::SessionInvalid
            | Self::SessionExpired
            | Self::SessionRevoked => StatusCode::UNAUTHORIZED,
            Self::AccountDisabled | Self::PermissionDenied | Self::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UnknownAction(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateRequest(_) => StatusCode::CONFLICT,
            Self::Custom { code, .. } => match *code {
                code::NOT_FOUND => StatusCode::NOT_FOUND,
                code::CONFLICT => StatusCode::CONFLICT,
                code::INVALID_CREDENTIALS => StatusCode::UNAUTHORIZED,
                _ => StatusCode::BAD_REQUEST,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.to_body(false),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        tracing::error!(?err, "store error");
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_message_is_hidden_by_default() {
        let err = GatewayError::internal("connection refused at 10.0.0.3:5432");
        let body = err.to_body(false);
        assert_eq!(body.code, "INTERNAL_ERROR");
        assert_eq!(body.message, INTERNAL_MESSAGE);

        let body = err.to_body(true);
        assert!(body.message.contains("10.0.0.3"));
    }

    #[test]
    fn validation_details_list_fields() {
        let err = GatewayError::Validation(vec![
            FieldError::new("email", "is required"),
            FieldError::new("password", "must be at least 8 characters"),
        ]);
        let body = err.to_body(false);
        assert_eq!(body.code, "VALIDATION_ERROR");
        let fields = body.details.unwrap()["fields"].as_array().unwrap().clone();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0]["field"], "email");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = GatewayError::RateLimited {
            message: "Too many login attempts. Try again in 120 seconds.".into(),
            retry_after_secs: 120,
        };
        let body = err.to_body(false);
        assert_eq!(body.code, "RATE_LIMITED");
        assert_eq!(body.details.unwrap()["retryAfterSecs"], 120);
    }

    #[test]
    fn custom_codes_pass_through() {
        let err = GatewayError::not_found("Invitation not found");
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::invalid_credentials().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn session_failures_are_classified() {
        assert!(GatewayError::SessionRevoked.is_session_failure());
        assert!(GatewayError::AccountDisabled.is_session_failure());
        assert!(!GatewayError::SessionRequired.is_session_failure());
        assert!(!GatewayError::PermissionDenied.is_session_failure());
    }
}
