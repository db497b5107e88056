use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorCode {
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 => Self::Auth,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            400 | 409 | 413 | 422 => Self::Validation,
            _ => Self::Unknown,
        }
    }
}

/// Tagged failure returned by every backend-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Auth, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn is_network(&self) -> bool {
        self.code == ErrorCode::Network
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure to turn a realtime frame into a typed event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("unsupported {operation} on table '{table}'")]
    UnsupportedOperation { table: String, operation: String },
    #[error("malformed row for table '{table}': {source}")]
    MalformedRow {
        table: String,
        source: serde_json::Error,
    },
    #[error("unknown broadcast topic '{0}'")]
    UnknownTopic(String),
    #[error("unknown broadcast event '{event}' on topic '{topic}'")]
    UnknownEvent { topic: String, event: String },
    #[error("malformed '{event}' payload: {source}")]
    MalformedPayload {
        event: String,
        source: serde_json::Error,
    },
    #[error("counter row names neither a conversation nor a group")]
    CounterWithoutThread,
}
