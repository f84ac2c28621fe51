//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

use crate::policy::PolicyError;

/// Errors from the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: &'static str, detail: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors from the WhatsApp Cloud API.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request never produced an HTTP response.
    #[error("provider request failed: {0}")]
    Request(String),

    /// Non-2xx response; `body` is the provider's error payload.
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: Value },

    /// 2xx response missing a field the caller depends on.
    #[error("provider response missing {0}")]
    MissingField(&'static str),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Request(err.to_string())
    }
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Validation { field: String, message: String },

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn missing(field: impl Into<String>) -> Self {
        let field = field.into();
        GatewayError::Validation {
            message: format!("missing required field: {field}"),
            field,
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Policy(PolicyError::InsufficientCredits { .. }) => {
                StatusCode::PAYMENT_REQUIRED
            }
            GatewayError::Policy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Provider(_) | GatewayError::Store(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "success": false, "error": self.to_string() });
        match &self {
            GatewayError::Validation { field, .. } => {
                body["field"] = json!(field);
            }
            GatewayError::Policy(err) => {
                body["code"] = json!(err.code());
            }
            GatewayError::Provider(err) => {
                tracing::error!("provider error: {}", err);
                if let ProviderError::Status { status, body: provider_body } = err {
                    body["provider_status"] = json!(status);
                    body["provider_error"] = provider_body.clone();
                }
            }
            GatewayError::Store(err) => {
                tracing::error!("store error: {}", err);
                body["error"] = json!("internal error");
            }
            GatewayError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
