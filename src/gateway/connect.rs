//! Connect protocol transport over HTTP (`reqwest`).
//!
//! Unary: `POST {endpoint}/{Service}/{Method}` with a JSON body. Errors come
//! back as a non-2xx status with a JSON body `{"code": ..., "message": ...}`.
//!
//! Server streaming: `POST` with `content-type: application/connect+json`.
//! Request and response messages are enveloped:
//!
//! ```text
//! ┌────────┬──────────────────┬─────────────────┐
//! │ flags  │ length (u32 BE)  │ payload (JSON)  │
//! │ 1 byte │ 4 bytes          │ length bytes    │
//! └────────┴──────────────────┴─────────────────┘
//! ```
//!
//! Flag `0x02` marks the end-of-stream message, whose JSON may carry an
//! `error` object. Compressed envelopes (`0x01`) are not negotiated.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use url::Url;

use super::transport::{FrameStream, Transport, TransportError, TransportStatus};
use super::Metadata;

const CONTENT_TYPE_UNARY: &str = "application/json";
const CONTENT_TYPE_STREAM: &str = "application/connect+json";
const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
const TIMEOUT_HEADER: &str = "connect-timeout-ms";

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_END_STREAM: u8 = 0x02;
const ENVELOPE_HEADER_LEN: usize = 5;
/// Upper bound for one message; larger frames indicate a corrupt stream.
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Connect-over-HTTP transport.
#[derive(Debug, Clone)]
pub struct ConnectTransport {
    client: reqwest::Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl ConnectTransport {
    /// Create a transport targeting `endpoint` (e.g. `https://traceguard.internal:8080`).
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let endpoint = normalize_endpoint(endpoint)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::network(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn operation_url(&self, operation: &str) -> Result<Url, TransportError> {
        self.endpoint
            .join(operation.trim_start_matches('/'))
            .map_err(|e| {
                TransportError::new(
                    TransportStatus::InvalidArgument,
                    format!("bad operation name '{operation}': {e}"),
                )
            })
    }

    fn request(
        &self,
        operation: &str,
        metadata: &Metadata,
        content_type: &str,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut builder = self
            .client
            .post(self.operation_url(operation)?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(PROTOCOL_VERSION_HEADER, "1");
        for (key, value) in metadata.iter() {
            builder = builder.header(key, value);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for ConnectTransport {
    async fn send_unary(
        &self,
        operation: &str,
        metadata: &Metadata,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let response = self
            .request(operation, metadata, CONTENT_TYPE_UNARY)?
            .header(TIMEOUT_HEADER, self.request_timeout.as_millis().to_string())
            .timeout(self.request_timeout)
            .body(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &body));
        }
        Ok(body.to_vec())
    }

    async fn open_stream(
        &self,
        operation: &str,
        metadata: &Metadata,
        request: Vec<u8>,
    ) -> Result<FrameStream, TransportError> {
        let response = self
            .request(operation, metadata, CONTENT_TYPE_STREAM)?
            .body(encode_envelope(0, &request))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            return Err(error_from_body(status.as_u16(), &body));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(decode_frames(body))
    }
}

fn normalize_endpoint(endpoint: &str) -> Result<Url, TransportError> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(TransportError::new(
            TransportStatus::InvalidArgument,
            "endpoint must not be empty",
        ));
    }
    // `Url::join` replaces the last path segment unless the base ends in '/'.
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|e| {
        TransportError::new(
            TransportStatus::InvalidArgument,
            format!("invalid endpoint '{trimmed}': {e}"),
        )
    })
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::new(TransportStatus::DeadlineExceeded, error.to_string())
    } else if error.is_connect() {
        TransportError::unavailable(error.to_string())
    } else if error.is_builder() {
        TransportError::new(TransportStatus::InvalidArgument, error.to_string())
    } else {
        TransportError::network(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ConnectErrorBody {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndStreamBody {
    #[serde(default)]
    error: Option<ConnectErrorBody>,
}

fn error_from_body(http_status: u16, body: &[u8]) -> TransportError {
    match serde_json::from_slice::<ConnectErrorBody>(body) {
        Ok(err) => TransportError::new(
            TransportStatus::from_connect_code(&err.code),
            err.message.unwrap_or(err.code),
        ),
        Err(_) => TransportError::new(
            TransportStatus::from_http_status(http_status),
            format!("HTTP {http_status}: {}", String::from_utf8_lossy(body)),
        ),
    }
}

pub(crate) fn encode_envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, PartialEq, Eq)]
struct Envelope {
    flags: u8,
    payload: Vec<u8>,
}

/// Incremental envelope decoder over arbitrarily split body chunks.
#[derive(Debug, Default)]
struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    fn next_envelope(&mut self) -> Result<Option<Envelope>, TransportError> {
        if self.buf.len() < ENVELOPE_HEADER_LEN {
            return Ok(None);
        }
        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_MESSAGE_BYTES {
            return Err(TransportError::new(
                TransportStatus::Internal,
                format!("stream message of {len} bytes exceeds limit"),
            ));
        }
        if flags & FLAG_COMPRESSED != 0 {
            return Err(TransportError::new(
                TransportStatus::Internal,
                "compressed stream message without negotiated encoding",
            ));
        }
        if self.buf.len() < ENVELOPE_HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[ENVELOPE_HEADER_LEN..ENVELOPE_HEADER_LEN + len].to_vec();
        self.buf.drain(..ENVELOPE_HEADER_LEN + len);
        Ok(Some(Envelope { flags, payload }))
    }
}

struct FrameState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: EnvelopeDecoder,
    done: bool,
}

fn decode_frames(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> FrameStream {
    let state = FrameState {
        body,
        decoder: EnvelopeDecoder::default(),
        done: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.decoder.next_envelope() {
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                Ok(Some(envelope)) if envelope.flags & FLAG_END_STREAM != 0 => {
                    state.done = true;
                    return end_stream_error(&envelope.payload).map(|e| (Err(e), state));
                }
                Ok(Some(envelope)) => return Some((Ok(envelope.payload), state)),
                Ok(None) => {}
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(map_reqwest_error(e)), state));
                }
                None => {
                    state.done = true;
                    let reason = if state.decoder.has_partial() {
                        "stream truncated mid-message"
                    } else {
                        "stream ended without end-of-stream message"
                    };
                    return Some((Err(TransportError::network(reason)), state));
                }
            }
        }
    })
    .boxed()
}

fn end_stream_error(payload: &[u8]) -> Option<TransportError> {
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_slice::<EndStreamBody>(payload) {
        Ok(EndStreamBody { error: None }) => None,
        Ok(EndStreamBody { error: Some(err) }) => Some(TransportError::new(
            TransportStatus::from_connect_code(&err.code),
            err.message.unwrap_or(err.code),
        )),
        Err(e) => Some(TransportError::new(
            TransportStatus::Internal,
            format!("unparseable end-of-stream message: {e}"),
        )),
    }
}
