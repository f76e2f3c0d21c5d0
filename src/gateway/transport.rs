//! Transport seam consumed by the call gateway.
//!
//! A transport moves opaque bytes for a named operation. It knows nothing
//! about credentials, tracing or the error taxonomy; it reports failures
//! with a `TransportStatus` code that the gateway classifies.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::Metadata;

/// Sequence of raw event frames from a server-streaming call. The stream
/// ending (`None`) means the server closed it cleanly.
pub type FrameStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Transport capability: one unary shape and one server-streaming shape.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_unary(
        &self,
        operation: &str,
        metadata: &Metadata,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError>;

    async fn open_stream(
        &self,
        operation: &str,
        metadata: &Metadata,
        request: Vec<u8>,
    ) -> Result<FrameStream, TransportError>;
}

/// Status codes a transport can report (Connect/gRPC code space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    Unauthenticated,
    PermissionDenied,
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Canceled,
    Internal,
    Unknown,
    /// Connection-level failure (reset, TLS, DNS).
    Network,
}

impl TransportStatus {
    /// Parse a Connect protocol error code.
    pub fn from_connect_code(code: &str) -> Self {
        match code {
            "unauthenticated" => TransportStatus::Unauthenticated,
            "permission_denied" => TransportStatus::PermissionDenied,
            "not_found" => TransportStatus::NotFound,
            "invalid_argument" | "out_of_range" => TransportStatus::InvalidArgument,
            "failed_precondition" => TransportStatus::FailedPrecondition,
            "unavailable" => TransportStatus::Unavailable,
            "deadline_exceeded" => TransportStatus::DeadlineExceeded,
            "resource_exhausted" => TransportStatus::ResourceExhausted,
            "canceled" => TransportStatus::Canceled,
            "internal" | "data_loss" => TransportStatus::Internal,
            _ => TransportStatus::Unknown,
        }
    }

    /// Map an HTTP status when the body carries no Connect error code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => TransportStatus::InvalidArgument,
            401 => TransportStatus::Unauthenticated,
            403 => TransportStatus::PermissionDenied,
            404 => TransportStatus::NotFound,
            408 | 504 => TransportStatus::DeadlineExceeded,
            409 | 412 | 422 => TransportStatus::FailedPrecondition,
            429 => TransportStatus::ResourceExhausted,
            502 | 503 => TransportStatus::Unavailable,
            500..=599 => TransportStatus::Internal,
            _ => TransportStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportStatus::Unauthenticated => "unauthenticated",
            TransportStatus::PermissionDenied => "permission_denied",
            TransportStatus::NotFound => "not_found",
            TransportStatus::InvalidArgument => "invalid_argument",
            TransportStatus::FailedPrecondition => "failed_precondition",
            TransportStatus::Unavailable => "unavailable",
            TransportStatus::DeadlineExceeded => "deadline_exceeded",
            TransportStatus::ResourceExhausted => "resource_exhausted",
            TransportStatus::Canceled => "canceled",
            TransportStatus::Internal => "internal",
            TransportStatus::Unknown => "unknown",
            TransportStatus::Network => "network",
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct TransportError {
    pub status: TransportStatus,
    pub message: String,
}

impl TransportError {
    pub fn new(status: TransportStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportStatus::Network, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportStatus::Unavailable, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_codes() {
        assert_eq!(
            TransportStatus::from_connect_code("unauthenticated"),
            TransportStatus::Unauthenticated
        );
        assert_eq!(
            TransportStatus::from_connect_code("out_of_range"),
            TransportStatus::InvalidArgument
        );
        assert_eq!(
            TransportStatus::from_connect_code("something_new"),
            TransportStatus::Unknown
        );
    }

    #[test]
    fn test_http_status_fallback() {
        assert_eq!(
            TransportStatus::from_http_status(401),
            TransportStatus::Unauthenticated
        );
        assert_eq!(
            TransportStatus::from_http_status(503),
            TransportStatus::Unavailable
        );
        assert_eq!(
            TransportStatus::from_http_status(500),
            TransportStatus::Internal
        );
    }
}
