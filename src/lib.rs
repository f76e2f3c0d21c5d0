//! TraceGuard sync client
//!
//! Client-side synchronization layer for the TraceGuard SBOM / provenance
//! backend:
//!
//! - `gateway`: unary and server-streaming calls over a pluggable
//!   `Transport`, with B3 trace headers, bearer auth and a typed error
//!   taxonomy.
//! - `session`: credential lifecycle (login, restore, logout, forced
//!   logout on auth failure) shared by every call.
//! - `sync`: the live-sync engine that merges the update stream with
//!   paginated snapshots into observable local stores.
//!
//! ```ignore
//! let session = SessionState::new(Arc::new(FileCredentialStorage::new(".traceguard")));
//! let transport = Arc::new(ConnectTransport::new("https://traceguard.example.com", timeout)?);
//! let gateway = CallGateway::new(transport, session);
//!
//! let sessions = SessionManager::new(gateway.clone());
//! sessions.login(&LoginRequest::new("alice", "secret")).await?;
//!
//! let engine = LiveSyncEngine::new(gateway, SyncOptions::default()).start();
//! let mut sboms = engine.sboms().subscribe();
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod session;
pub mod sync;
pub mod trace;

pub use client::{LoginRequest, TraceGuardClient};
pub use config::SyncConfig;
pub use error::{AuthError, CallError, ConfigError, StorageError};
pub use gateway::{CallGateway, EventStream, Metadata, StreamEnd, StreamFrame, Transport};
pub use model::{Entity, EntityKind, ProvenanceRecord, Sbom, UpdateEvent, UpdateKind};
pub use session::{Credential, SessionManager, SessionState};
pub use sync::{EngineHandle, LiveSyncEngine, SyncOptions, SyncState, ViewStore};
pub use trace::TraceContext;
