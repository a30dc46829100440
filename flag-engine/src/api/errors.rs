use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

use crate::redis::CustomRedisError;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: &'static str,
    pub detail: String,
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    Dependency,
    Internal,
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("Feature '{0}' not found")]
    FlagNotFound(String),
    #[error("Override {kind}:{target_id} not found on feature '{key}'")]
    OverrideNotFound {
        key: String,
        kind: String,
        target_id: String,
    },
    #[error("Feature '{0}' already exists")]
    FlagAlreadyExists(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("redis unavailable")]
    RedisUnavailable,
    #[error("failed to parse redis cache data")]
    RedisDataParsingError,
    #[error("Timed out while talking to a dependency")]
    TimeoutError,
    #[error("database unavailable")]
    DatabaseUnavailable,
    #[error("Database error: {0}")]
    DatabaseError(sqlx::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlagError::FlagNotFound(_) | FlagError::OverrideNotFound { .. } => ErrorKind::NotFound,
            FlagError::FlagAlreadyExists(_) => ErrorKind::Conflict,
            FlagError::BadRequest(_) | FlagError::RequestParsingError(_) => ErrorKind::BadRequest,
            FlagError::RedisUnavailable
            | FlagError::RedisDataParsingError
            | FlagError::TimeoutError
            | FlagError::DatabaseUnavailable
            | FlagError::DatabaseError(_) => ErrorKind::Dependency,
            FlagError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short error code used in responses, logs and metric labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            FlagError::FlagNotFound(_) => "flag_not_found",
            FlagError::OverrideNotFound { .. } => "override_not_found",
            FlagError::FlagAlreadyExists(_) => "flag_already_exists",
            FlagError::BadRequest(_) => "bad_request",
            FlagError::RequestParsingError(_) => "request_parsing_error",
            FlagError::RedisUnavailable => "redis_unavailable",
            FlagError::RedisDataParsingError => "redis_parsing_error",
            FlagError::TimeoutError => "timeout",
            FlagError::DatabaseUnavailable => "database_unavailable",
            FlagError::DatabaseError(_) => "database_error",
            FlagError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Dependency => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = match self.kind() {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BadRequest => "validation_error",
            ErrorKind::Dependency => "dependency_error",
            ErrorKind::Internal => "server_error",
        };

        if status.is_server_error() {
            tracing::error!(code = self.error_code(), "request failed: {}", self);
        } else {
            tracing::warn!(code = self.error_code(), "request rejected: {}", self);
        }

        // Dependency internals are logged above, not echoed to callers.
        let detail = match self.kind() {
            ErrorKind::Dependency | ErrorKind::Internal => match &self {
                FlagError::TimeoutError => "A dependency timed out. Please try again.".to_string(),
                _ => "A dependency is unavailable. Please try again.".to_string(),
            },
            _ => self.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error_type,
                code: self.error_code(),
                detail,
            }),
        )
            .into_response()
    }
}

impl From<CustomRedisError> for FlagError {
    fn from(e: CustomRedisError) -> Self {
        match e {
            CustomRedisError::Timeout => FlagError::TimeoutError,
            CustomRedisError::ParseError(_) => FlagError::RedisDataParsingError,
            CustomRedisError::NotFound
            | CustomRedisError::InvalidConfiguration(_)
            | CustomRedisError::Redis(_) => FlagError::RedisUnavailable,
        }
    }
}

impl From<sqlx::Error> for FlagError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => FlagError::TimeoutError,
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) => FlagError::DatabaseUnavailable,
            other => FlagError::DatabaseError(other),
        }
    }
}
