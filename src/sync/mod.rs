//! Live synchronization of SBOM and provenance collections.
//!
//! ## Data flow
//!
//! ```text
//!   StreamUpdates ──► EventStream ──┐
//!                                   ├──► Reconciler ──► ViewStore (watch)
//!   List* pages ──► SnapshotFetcher ┘      (per kind)
//! ```
//!
//! Both inputs are merged by `(id, version)`; the stream may deliver events
//! that are older, newer or interleaved with snapshot pages and the stores
//! still converge.

mod backoff;
mod engine;
mod reconcile;
mod snapshot;
mod store;

pub use backoff::BackoffPolicy;
pub use engine::{
    EngineHandle, EngineStatus, LiveSyncEngine, SyncOptions, SyncState, SyncTransition,
};
pub use reconcile::{Applied, Reconciler, RecordMap};
pub use store::{Degraded, StoreView, ViewStore};
