use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Process-level errors: startup, configuration and the plain HTTP routes.
#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(AuthFailure),

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized(failure) => failure.code(),
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound => "NOT_FOUND",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        })
    }
}

/// Why a connection credential was refused. The connection is rejected and
/// never retried server-side.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("no credential presented")]
    MissingCredential,

    #[error("credential could not be parsed or verified")]
    MalformedCredential,

    #[error("credential has expired")]
    ExpiredCredential,

    #[error("credential does not resolve to a known user")]
    UnknownPrincipal,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential => "MissingCredential",
            AuthFailure::MalformedCredential => "MalformedCredential",
            AuthFailure::ExpiredCredential => "ExpiredCredential",
            AuthFailure::UnknownPrincipal => "UnknownPrincipal",
        }
    }
}

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        AppError::Unauthorized(failure)
    }
}

/// Failure of a single send/read/typing operation. Reported to the caller only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

impl ChatError {
    /// Stable reason code sent to clients in `message:error` / `request:error`.
    pub fn reason(&self) -> &'static str {
        match self {
            ChatError::InvalidPayload(_) => "InvalidPayload",
            ChatError::NotFound => "NotFound",
            ChatError::Forbidden => "Forbidden",
            ChatError::RateLimitExceeded { .. } => "RateLimitExceeded",
            ChatError::PersistenceFailed(_) => "PersistenceFailed",
        }
    }
}

impl From<crate::store::StoreError> for ChatError {
    fn from(e: crate::store::StoreError) -> Self {
        ChatError::PersistenceFailed(e.to_string())
    }
}

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::InvalidPayload(msg) => AppError::BadRequest(msg),
            ChatError::NotFound => AppError::NotFound,
            ChatError::Forbidden => AppError::Forbidden,
            ChatError::RateLimitExceeded { .. } => AppError::BadRequest(e.to_string()),
            ChatError::PersistenceFailed(msg) => AppError::Database(msg),
        }
    }
}

/// Failure of the cluster fan-out adapter. Logged, never surfaced to clients.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("envelope encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failure of the write-behind log. Retried by the consumer loop after a backoff.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("entry encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(
            ChatError::InvalidPayload("x".into()).reason(),
            "InvalidPayload"
        );
        assert_eq!(
            ChatError::RateLimitExceeded {
                retry_after_secs: 3
            }
            .reason(),
            "RateLimitExceeded"
        );
        assert_eq!(
            ChatError::PersistenceFailed("down".into()).reason(),
            "PersistenceFailed"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::from(AuthFailure::ExpiredCredential).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(ChatError::Forbidden).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Database("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
