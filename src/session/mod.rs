//! Session lifecycle - the credential that gates every backend call.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  SessionManager (login / restore / logout)              │
//! │     └── SessionState (Arc, shared)                      │
//! │           ├── storage: dyn CredentialStorage            │
//! │           └── status:  watch::Sender<SessionStatus>     │
//! └─────────────────────────────────────────────────────────┘
//!            │ read per call               │ subscribe
//!            ▼                             ▼
//!      CallGateway                   LiveSyncEngine
//! ```
//!
//! The gateway only reads the credential and, on an authentication failure,
//! asks the state to expire the epoch it used. Every change bumps the session
//! `epoch`, so subscribers can tell a re-login apart from a no-op even if the
//! watch channel coalesced the logout in between.

mod manager;
mod storage;

pub use manager::SessionManager;
pub use storage::{
    CredentialStorage, FileCredentialStorage, MemoryCredentialStorage, SESSION_STORAGE_KEY,
};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::StorageError;

/// Bearer credential for the authenticated subject.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub subject: String,
}

impl Credential {
    /// An unknown expiry never counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("subject", &self.subject)
            .finish()
    }
}

/// Why the session last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    /// Process start, nothing restored yet.
    Initial,
    Authenticated,
    LoggedOut,
    /// Backend rejected the credential.
    Expired,
}

/// Snapshot published to subscribers on every change.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Incremented on every login/logout/expiry.
    pub epoch: u64,
    pub credential: Option<Credential>,
    pub change: SessionChange,
}

impl SessionStatus {
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }
}

/// Receiver side of the session notifications.
pub type SessionWatcher = watch::Receiver<SessionStatus>;

struct SessionInner {
    storage: Arc<dyn CredentialStorage>,
    status: watch::Sender<SessionStatus>,
}

/// Shared credential cell. Cheap to clone.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<SessionInner>,
}

impl SessionState {
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            epoch: 0,
            credential: None,
            change: SessionChange::Initial,
        });
        Self {
            inner: Arc::new(SessionInner { storage, status }),
        }
    }

    /// Synchronous read of the current credential. Never blocks on I/O.
    pub fn current(&self) -> Option<Credential> {
        self.inner.status.borrow().credential.clone()
    }

    /// Current credential together with the epoch it belongs to.
    pub fn current_with_epoch(&self) -> (u64, Option<Credential>) {
        let status = self.inner.status.borrow();
        (status.epoch, status.credential.clone())
    }

    pub fn epoch(&self) -> u64 {
        self.inner.status.borrow().epoch
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> SessionWatcher {
        self.inner.status.subscribe()
    }

    pub(crate) fn storage(&self) -> &Arc<dyn CredentialStorage> {
        &self.inner.storage
    }

    /// Persist and publish a freshly issued credential.
    pub(crate) fn establish(&self, credential: Credential) -> Result<u64, StorageError> {
        self.inner.storage.save(&credential)?;
        Ok(self.publish(Some(credential), SessionChange::Authenticated))
    }

    /// Publish a credential read back from storage.
    pub(crate) fn adopt(&self, credential: Credential) -> u64 {
        self.publish(Some(credential), SessionChange::Authenticated)
    }

    /// End the session. Returns `false` when there was nothing to end.
    pub(crate) fn end(&self, change: SessionChange) -> bool {
        if let Err(e) = self.inner.storage.clear() {
            tracing::warn!(error = %e, "Failed to clear persisted session (continuing)");
        }
        let mut ended = false;
        self.inner.status.send_if_modified(|status| {
            if status.credential.is_none() {
                return false;
            }
            status.epoch += 1;
            status.credential = None;
            status.change = change;
            ended = true;
            true
        });
        ended
    }

    /// Forced logout after an authentication failure on a call made under
    /// `epoch`. A stale call cannot end a newer session.
    pub(crate) fn expire(&self, epoch: u64) -> bool {
        let current = self.epoch();
        if current != epoch {
            tracing::debug!(
                call_epoch = epoch,
                current_epoch = current,
                "Ignoring auth failure from a previous session"
            );
            return false;
        }
        let ended = self.end(SessionChange::Expired);
        if ended {
            tracing::warn!(epoch, "Credential rejected by backend, session expired");
        }
        ended
    }

    fn publish(&self, credential: Option<Credential>, change: SessionChange) -> u64 {
        let mut epoch = 0;
        self.inner.status.send_modify(|status| {
            status.epoch += 1;
            status.credential = credential;
            status.change = change;
            epoch = status.epoch;
        });
        epoch
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}
