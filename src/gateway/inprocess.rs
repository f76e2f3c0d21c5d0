//! In-process transport.
//!
//! Unary operations are served by registered handlers; every `open_stream`
//! hands a `StreamFeed` to whoever holds the feed receiver, who then pushes
//! frames into that stream. All calls are recorded with their metadata.
//! Used by the test suite and by embedders that host the backend in the
//! same process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::transport::{FrameStream, Transport, TransportError, TransportStatus};
use super::Metadata;

type UnaryHandler =
    Arc<dyn Fn(&Metadata, &[u8]) -> Result<Vec<u8>, TransportError> + Send + Sync>;

type FrameSender = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    Stream,
}

/// One call observed by the transport.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub shape: CallShape,
    pub operation: String,
    pub metadata: Metadata,
    pub request: Vec<u8>,
}

/// Server side of one opened stream.
#[derive(Debug)]
pub struct StreamFeed {
    pub operation: String,
    pub metadata: Metadata,
    pub request: Vec<u8>,
    sender: FrameSender,
}

impl StreamFeed {
    /// Push one JSON-encoded event. Returns `false` once the client side
    /// has gone away.
    pub fn send_json<T: Serialize>(&self, event: &T) -> bool {
        match serde_json::to_vec(event) {
            Ok(bytes) => self.send_raw(bytes),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.sender.send(Ok(bytes.into())).is_ok()
    }

    /// Fail the stream with a transport error.
    pub fn fail(self, error: TransportError) {
        let _ = self.sender.send(Err(error));
    }

    /// End the stream cleanly.
    pub fn close(self) {}

    /// Whether the client released the connection.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Transport served from the current process.
pub struct InProcessTransport {
    unary: Mutex<HashMap<String, UnaryHandler>>,
    unary_latency: Mutex<Option<Duration>>,
    open_failures: Mutex<VecDeque<TransportError>>,
    feeds_tx: mpsc::UnboundedSender<StreamFeed>,
    feeds_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamFeed>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        let (feeds_tx, feeds_rx) = mpsc::unbounded_channel();
        Self {
            unary: Mutex::new(HashMap::new()),
            unary_latency: Mutex::new(None),
            open_failures: Mutex::new(VecDeque::new()),
            feeds_tx,
            feeds_rx: Mutex::new(Some(feeds_rx)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Register a raw unary handler, replacing any previous one.
    pub fn on_unary<F>(&self, operation: &str, handler: F)
    where
        F: Fn(&Metadata, &[u8]) -> Result<Vec<u8>, TransportError> + Send + Sync + 'static,
    {
        lock(&self.unary).insert(operation.to_string(), Arc::new(handler));
    }

    /// Register a handler with JSON request/response decoding.
    pub fn on_unary_json<Req, Resp, F>(&self, operation: &str, handler: F)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(&Metadata, Req) -> Result<Resp, TransportError> + Send + Sync + 'static,
    {
        self.on_unary(operation, move |metadata, body| {
            let request: Req = serde_json::from_slice(body)
                .map_err(|e| TransportError::new(TransportStatus::InvalidArgument, e.to_string()))?;
            let response = handler(metadata, request)?;
            serde_json::to_vec(&response)
                .map_err(|e| TransportError::new(TransportStatus::Internal, e.to_string()))
        });
    }

    /// Delay every unary response (virtual time under paused tokio tests).
    pub fn set_unary_latency(&self, latency: Option<Duration>) {
        *lock(&self.unary_latency) = latency;
    }

    /// Make the next `open_stream` fail with `error`. Queued in order.
    pub fn fail_next_stream(&self, error: TransportError) {
        lock(&self.open_failures).push_back(error);
    }

    /// Take the receiver of stream feeds. Only the first caller gets it.
    pub fn take_stream_feeds(&self) -> Option<mpsc::UnboundedReceiver<StreamFeed>> {
        lock(&self.feeds_rx).take()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    fn record(&self, shape: CallShape, operation: &str, metadata: &Metadata, request: &[u8]) {
        lock(&self.calls).push(RecordedCall {
            shape,
            operation: operation.to_string(),
            metadata: metadata.clone(),
            request: request.to_vec(),
        });
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send_unary(
        &self,
        operation: &str,
        metadata: &Metadata,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(CallShape::Unary, operation, metadata, &request);
        let latency = *lock(&self.unary_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let handler = lock(&self.unary).get(operation).cloned();
        match handler {
            Some(handler) => handler(metadata, &request),
            None => Err(TransportError::new(
                TransportStatus::Unknown,
                format!("unimplemented operation {operation}"),
            )),
        }
    }

    async fn open_stream(
        &self,
        operation: &str,
        metadata: &Metadata,
        request: Vec<u8>,
    ) -> Result<FrameStream, TransportError> {
        self.record(CallShape::Stream, operation, metadata, &request);
        if let Some(error) = lock(&self.open_failures).pop_front() {
            return Err(error);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let feed = StreamFeed {
            operation: operation.to_string(),
            metadata: metadata.clone(),
            request,
            sender,
        };
        if self.feeds_tx.send(feed).is_err() {
            tracing::debug!(operation, "No stream feed consumer, stream will end immediately");
        }
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A handler panicking under the lock must not wedge the transport.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
