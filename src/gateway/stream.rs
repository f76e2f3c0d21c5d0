//! Lazy, cancellable event sequence returned by `CallGateway::stream_call`.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::error::CallError;
use crate::session::SessionState;

use super::classify;
use super::transport::FrameStream;

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Caller invoked the cancel handle. Not an error.
    Cancelled,
    /// Transport dropped or the server finished the stream.
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server ended the stream without an error.
    EndOfStream,
    Failed(CallError),
}

/// One pull from an `EventStream`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame<T> {
    Event(T),
    /// A single frame failed to decode. The stream stays open.
    Skipped(CallError),
    /// Terminal marker. Every later pull returns the same marker.
    End(StreamEnd),
}

/// Cancels the stream it was taken from. Cloneable and idempotent.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Decoded server-streaming call.
///
/// Frames are decoded one at a time in arrival order; nothing is buffered
/// beyond the frame being decoded. The underlying connection is released as
/// soon as the stream reaches a terminal marker or is dropped. Restart by
/// issuing a new `stream_call`.
pub struct EventStream<T> {
    operation: String,
    frames: Option<FrameStream>,
    cancel: CancelHandle,
    cancel_rx: watch::Receiver<bool>,
    ended: Option<StreamEnd>,
    session: SessionState,
    epoch: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> EventStream<T> {
    pub(crate) fn new(
        operation: &str,
        frames: FrameStream,
        session: SessionState,
        epoch: u64,
    ) -> Self {
        let (cancel, cancel_rx) = CancelHandle::new();
        Self {
            operation: operation.to_string(),
            frames: Some(frames),
            cancel,
            cancel_rx,
            ended: None,
            session,
            epoch,
            _marker: PhantomData,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    /// Await the next frame. Suspends only the calling task.
    pub async fn next(&mut self) -> StreamFrame<T> {
        if let Some(end) = &self.ended {
            return StreamFrame::End(end.clone());
        }
        let Some(frames) = self.frames.as_mut() else {
            return self.finish(StreamEnd::Closed(CloseReason::EndOfStream));
        };

        let pulled = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel_rx) => None,
            frame = frames.next() => Some(frame),
        };

        match pulled {
            None => self.finish(StreamEnd::Cancelled),
            Some(None) => self.finish(StreamEnd::Closed(CloseReason::EndOfStream)),
            Some(Some(Err(e))) => {
                let error = classify(e);
                if error.is_auth() {
                    self.session.expire(self.epoch);
                }
                self.finish(StreamEnd::Closed(CloseReason::Failed(error)))
            }
            Some(Some(Ok(bytes))) => match serde_json::from_slice::<T>(&bytes) {
                Ok(event) => StreamFrame::Event(event),
                Err(e) => StreamFrame::Skipped(CallError::validation(format!(
                    "undecodable frame on {}: {e}",
                    self.operation
                ))),
            },
        }
    }

    /// Adapt into a `futures::Stream` that yields the terminal marker last.
    pub fn into_stream(self) -> impl Stream<Item = StreamFrame<T>> + Send
    where
        T: Send + 'static,
    {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            let frame = stream.next().await;
            let more = !matches!(frame, StreamFrame::End(_));
            Some((frame, more.then_some(stream)))
        })
    }

    fn finish(&mut self, end: StreamEnd) -> StreamFrame<T> {
        // Dropping the frame stream releases the connection.
        self.frames = None;
        tracing::debug!(operation = %self.operation, end = ?end, "Stream ended");
        self.ended = Some(end.clone());
        StreamFrame::End(end)
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
