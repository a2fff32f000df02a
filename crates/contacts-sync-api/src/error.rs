use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use contacts_sync_core::oauth::OAuthError;
use contacts_sync_core::sync::ApplyError;
use contacts_sync_core::{SyncError, VaultError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No Google account is connected")]
    NotConnected,
    #[error("Google authorization expired, connect the account again: {0}")]
    ReauthorizationRequired(String),
    #[error("Stored credential is unreadable, connect the account again")]
    CredentialCorrupted,
    #[error("External dependency error: {0}")]
    External(String),
    #[error("Request did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotConnected | Self::ReauthorizationRequired(_) => {
                StatusCode::PRECONDITION_FAILED
            }
            Self::CredentialCorrupted => StatusCode::CONFLICT,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code clients branch on
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::NotConnected => "not_connected",
            Self::ReauthorizationRequired(_) => "reauthorization_required",
            Self::CredentialCorrupted => "credential_corrupted",
            Self::External(_) => "upstream_failure",
            Self::Timeout(_) => "deadline_exceeded",
            Self::Config(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if status.is_server_error() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
            match self {
                Self::External(_) | Self::Timeout(_) => self.to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };
        let body = ErrorBody {
            error,
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<VaultError> for AppError {
    fn from(error: VaultError) -> Self {
        match error {
            VaultError::NotConnected => Self::NotConnected,
            VaultError::Refresh(message) => Self::ReauthorizationRequired(message),
            VaultError::Crypto(_) => Self::CredentialCorrupted,
            VaultError::InvalidState => Self::bad_request(error.to_string()),
            VaultError::Exchange(OAuthError::Http(source)) => {
                Self::External(format!("Authorization code exchange failed: {source}"))
            }
            VaultError::Exchange(source) => {
                Self::bad_request(format!("Authorization code exchange failed: {source}"))
            }
            VaultError::Storage(source) => Self::internal(source.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::NotConnected => Self::NotConnected,
            SyncError::Refresh(message) => Self::ReauthorizationRequired(message),
            SyncError::Crypto(_) => Self::CredentialCorrupted,
            SyncError::Authorization(source) => source.into(),
            SyncError::RemoteFetch(_) | SyncError::LocalFetch(_) => Self::External(error.to_string()),
            SyncError::LocalNotFound(local_id) => {
                Self::NotFound(format!("Client {local_id} does not exist"))
            }
            SyncError::Apply(ApplyError::Remote(_) | ApplyError::Local(_)) => {
                Self::External(error.to_string())
            }
            SyncError::DeadlineExceeded(deadline) => Self::Timeout(deadline),
            SyncError::Storage(_) | SyncError::Metadata(_) | SyncError::Apply(_) => {
                Self::internal(error.to_string())
            }
        }
    }
}
