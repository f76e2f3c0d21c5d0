//! Call Gateway - the single chokepoint for backend interaction.
//!
//! Offers `unary_call` and `stream_call` over an injected `Transport`.
//! Before every call the gateway:
//!
//! 1. generates a fresh `TraceContext` and writes the B3 headers,
//! 2. attaches the current credential as `authorization: Bearer ...`
//!    (except for `anonymous_call`, which login goes through),
//! 3. encodes the request as JSON.
//!
//! Failures are classified into exactly one `CallError` variant. An `Auth`
//! failure on a call that carried a credential ends that session. The
//! gateway never retries and never reconnects; retry policy belongs to the
//! caller (see `sync::engine`).

pub mod connect;
pub mod inprocess;
mod stream;
mod transport;

pub use stream::{CancelHandle, CloseReason, EventStream, StreamEnd, StreamFrame};
pub use transport::{FrameStream, Transport, TransportError, TransportStatus};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::Instrument;

use crate::error::CallError;
use crate::session::SessionState;
use crate::trace::TraceContext;

/// Bearer credential header.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Call metadata (headers). Keys are lower-case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Map a raw transport failure onto the error taxonomy.
pub(crate) fn classify(error: TransportError) -> CallError {
    let message = error.message;
    match error.status {
        TransportStatus::Unauthenticated | TransportStatus::PermissionDenied => {
            CallError::Auth { message }
        }
        TransportStatus::NotFound => CallError::NotFound { message },
        TransportStatus::InvalidArgument | TransportStatus::FailedPrecondition => {
            CallError::Validation { message }
        }
        TransportStatus::Unavailable
        | TransportStatus::DeadlineExceeded
        | TransportStatus::ResourceExhausted => CallError::Unavailable { message },
        TransportStatus::Network
        | TransportStatus::Internal
        | TransportStatus::Unknown
        | TransportStatus::Canceled => CallError::Transport { message },
    }
}

/// Whether a call carries the session credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallAuth {
    Session,
    Anonymous,
}

/// Per-call preparation result.
struct Prepared {
    metadata: Metadata,
    trace: TraceContext,
    epoch: u64,
    authenticated: bool,
}

/// Gateway over a transport. Cheap to clone; clones share the transport
/// and the session.
#[derive(Clone)]
pub struct CallGateway {
    transport: Arc<dyn Transport>,
    session: SessionState,
    sample_traces: bool,
}

impl CallGateway {
    pub fn new(transport: Arc<dyn Transport>, session: SessionState) -> Self {
        Self {
            transport,
            session,
            sample_traces: true,
        }
    }

    /// Set the B3 sampling flag sent with every call.
    pub fn with_trace_sampling(mut self, sampled: bool) -> Self {
        self.sample_traces = sampled;
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    fn prepare(&self, auth: CallAuth) -> Prepared {
        let trace = TraceContext::new_root(self.sample_traces);
        let mut metadata = Metadata::new();
        trace.inject(&mut metadata);

        let (epoch, credential) = self.session.current_with_epoch();
        let credential = credential.filter(|_| auth == CallAuth::Session);
        let authenticated = credential.is_some();
        if let Some(credential) = credential {
            metadata.insert(AUTHORIZATION_KEY, credential.bearer());
        }
        Prepared {
            metadata,
            trace,
            epoch,
            authenticated,
        }
    }

    fn on_failure(&self, operation: &str, prepared: &Prepared, error: &CallError) {
        tracing::debug!(
            operation,
            trace_id = %prepared.trace.trace_id,
            kind = error.kind(),
            error = %error,
            "Call failed"
        );
        if error.is_auth() && prepared.authenticated {
            self.session.expire(prepared.epoch);
        }
    }

    /// One request/response exchange.
    pub async fn unary_call<Req, Resp>(
        &self,
        operation: &str,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.unary(operation, request, CallAuth::Session).await
    }

    /// Unary exchange sent without the session credential. An auth failure
    /// here leaves the current session alone; used for the login exchange.
    pub async fn anonymous_call<Req, Resp>(
        &self,
        operation: &str,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.unary(operation, request, CallAuth::Anonymous).await
    }

    async fn unary<Req, Resp>(
        &self,
        operation: &str,
        request: &Req,
        auth: CallAuth,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|e| {
            CallError::validation(format!("unencodable {operation} request: {e}"))
        })?;
        let prepared = self.prepare(auth);
        let span = tracing::debug_span!(
            "unary_call",
            operation,
            trace_id = %prepared.trace.trace_id,
            span_id = %prepared.trace.span_id,
        );

        let result = async {
            let bytes = self
                .transport
                .send_unary(operation, &prepared.metadata, body)
                .await
                .map_err(classify)?;
            serde_json::from_slice::<Resp>(&bytes).map_err(|e| {
                CallError::validation(format!("unparseable {operation} response: {e}"))
            })
        }
        .instrument(span)
        .await;

        if let Err(error) = &result {
            self.on_failure(operation, &prepared, error);
        }
        result
    }

    /// Open one server-streaming call.
    pub async fn stream_call<Req, T>(
        &self,
        operation: &str,
        request: &Req,
    ) -> Result<EventStream<T>, CallError>
    where
        Req: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|e| {
            CallError::validation(format!("unencodable {operation} request: {e}"))
        })?;
        let prepared = self.prepare(CallAuth::Session);
        let span = tracing::debug_span!(
            "stream_call",
            operation,
            trace_id = %prepared.trace.trace_id,
            span_id = %prepared.trace.span_id,
        );

        let opened = self
            .transport
            .open_stream(operation, &prepared.metadata, body)
            .instrument(span)
            .await
            .map_err(classify);

        match opened {
            Ok(frames) => {
                tracing::debug!(operation, trace_id = %prepared.trace.trace_id, "Stream opened");
                Ok(EventStream::new(
                    operation,
                    frames,
                    self.session.clone(),
                    prepared.epoch,
                ))
            }
            Err(error) => {
                self.on_failure(operation, &prepared, &error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys_are_case_insensitive() {
        let mut metadata = Metadata::new();
        metadata.insert("Authorization", "Bearer x");
        assert_eq!(metadata.get("authorization"), Some("Bearer x"));
        assert_eq!(metadata.get("AUTHORIZATION"), Some("Bearer x"));
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn test_classification_is_total() {
        let cases = [
            (TransportStatus::Unauthenticated, "auth"),
            (TransportStatus::PermissionDenied, "auth"),
            (TransportStatus::NotFound, "not_found"),
            (TransportStatus::InvalidArgument, "validation"),
            (TransportStatus::FailedPrecondition, "validation"),
            (TransportStatus::Unavailable, "unavailable"),
            (TransportStatus::DeadlineExceeded, "unavailable"),
            (TransportStatus::ResourceExhausted, "unavailable"),
            (TransportStatus::Network, "transport"),
            (TransportStatus::Internal, "transport"),
            (TransportStatus::Unknown, "transport"),
            (TransportStatus::Canceled, "transport"),
        ];
        for (status, kind) in cases {
            assert_eq!(classify(TransportError::new(status, "x")).kind(), kind, "{status}");
        }
    }
}
