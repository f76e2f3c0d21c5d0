//! Error taxonomy for the sync layer
//!
//! Every backend interaction is classified by the call gateway into exactly
//! one `CallError` variant. Session-level failures are `AuthError`; storage
//! of the persisted credential fails with `StorageError`.

use thiserror::Error;

/// Classified outcome of a failed gateway call.
///
/// `Cancelled` is deliberately absent: caller-initiated cancellation of a
/// stream is a normal terminal marker, not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Credential missing, expired or rejected. Triggers a forced logout.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    /// Malformed request or unparseable response payload.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network or transport-level failure.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// Backend unreachable. Eligible for caller-driven retry.
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
}

impl CallError {
    pub fn auth(message: impl Into<String>) -> Self {
        CallError::Auth {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CallError::NotFound {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CallError::Validation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        CallError::Transport {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        CallError::Unavailable {
            message: message.into(),
        }
    }

    /// Whether a retry policy may re-issue the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::Transport { .. } | CallError::Unavailable { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, CallError::Auth { .. })
    }

    /// Short stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Auth { .. } => "auth",
            CallError::NotFound { .. } => "not_found",
            CallError::Validation { .. } => "validation",
            CallError::Transport { .. } => "transport",
            CallError::Unavailable { .. } => "unavailable",
        }
    }
}

/// Failures of the session lifecycle (login / restore).
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("login failed: {0}")]
    TransportFailure(CallError),

    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<CallError> for AuthError {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Auth { .. } => AuthError::InvalidCredentials,
            other => AuthError::TransportFailure(other),
        }
    }
}

/// Persisted-session storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("session storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persisted session is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("session storage unavailable: {message}")]
    Unavailable { message: String },
}

/// Invalid configuration values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
