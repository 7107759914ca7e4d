//! Error types for the bridge and its backend collaborator.

use crate::types::StoreHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status code attached to a backend failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendErrorCode {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    Internal,
}

impl BackendErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorCode::Cancelled => "cancelled",
            BackendErrorCode::InvalidArgument => "invalid-argument",
            BackendErrorCode::DeadlineExceeded => "deadline-exceeded",
            BackendErrorCode::NotFound => "not-found",
            BackendErrorCode::PermissionDenied => "permission-denied",
            BackendErrorCode::Unauthenticated => "unauthenticated",
            BackendErrorCode::Unavailable => "unavailable",
            BackendErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for BackendErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the backend. Carried through to the cache verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: BackendErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: BackendErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorCode::NotFound, message)
    }
}

/// Errors surfaced through a cache entry's error channel.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("named query not found: {name} (store {store})")]
    NamedQueryNotFound { store: StoreHandle, name: String },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

impl BridgeError {
    /// Backend status code, if this error came from the backend.
    pub fn backend_code(&self) -> Option<BackendErrorCode> {
        match self {
            BridgeError::Backend(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
