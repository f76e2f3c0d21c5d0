//! Distributed-trace context for outgoing calls.
//!
//! Each call gets a fresh root: a new 128-bit trace id and a 64-bit span id,
//! hex encoded and carried in the B3 propagation headers. Nothing here is
//! persisted or reused across calls.

use crate::gateway::Metadata;

/// B3 trace id header.
pub const TRACE_ID_KEY: &str = "x-b3-traceid";
/// B3 span id header.
pub const SPAN_ID_KEY: &str = "x-b3-spanid";
/// B3 sampling decision header (`"1"` / `"0"`).
pub const SAMPLED_KEY: &str = "x-b3-sampled";

/// Trace/span identifier pair for one outgoing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: bool,
}

impl TraceContext {
    /// Generate a new root context.
    pub fn new_root(sampled: bool) -> Self {
        let mut rng = rand::thread_rng();
        Self::from_rng(&mut rng, sampled)
    }

    pub(crate) fn from_rng<R: rand::Rng + ?Sized>(rng: &mut R, sampled: bool) -> Self {
        let trace: [u8; 16] = rng.gen();
        let mut span: [u8; 8] = rng.gen();
        // All-zero ids are invalid in B3.
        if span == [0u8; 8] {
            span[7] = 1;
        }
        Self {
            trace_id: hex::encode(trace),
            span_id: hex::encode(span),
            sampled,
        }
    }

    /// Write the propagation headers into call metadata.
    pub fn inject(&self, metadata: &mut Metadata) {
        metadata.insert(TRACE_ID_KEY, self.trace_id.clone());
        metadata.insert(SPAN_ID_KEY, self.span_id.clone());
        metadata.insert(SAMPLED_KEY, if self.sampled { "1" } else { "0" });
    }
}
