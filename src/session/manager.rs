//! SessionManager - login / restore / logout over the shared `SessionState`.

use chrono::Utc;

use crate::client::{LoginRequest, TraceGuardClient};
use crate::error::{AuthError, CallError, StorageError};
use crate::gateway::CallGateway;

use super::{Credential, SessionChange, SessionState, SessionWatcher};

/// Owns the credential lifecycle.
///
/// Every state change bumps the session epoch and is published to
/// subscribers; the live-sync engine tears its stream down and rebuilds it
/// from those notifications.
#[derive(Clone)]
pub struct SessionManager {
    client: TraceGuardClient,
    state: SessionState,
}

impl SessionManager {
    pub fn new(gateway: CallGateway) -> Self {
        let state = gateway.session().clone();
        Self {
            client: TraceGuardClient::new(gateway),
            state,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Exchange user input for a credential, persist it and announce it.
    pub async fn login(&self, input: &LoginRequest) -> Result<Credential, AuthError> {
        let response = self.client.login(input).await?;
        if response.token.trim().is_empty() {
            return Err(AuthError::TransportFailure(CallError::validation(
                "login response carried an empty token",
            )));
        }
        let credential = Credential {
            token: response.token,
            expires_at: response.expires_at,
            subject: response
                .subject
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| input.username.clone()),
        };
        let epoch = self.state.establish(credential.clone())?;
        tracing::info!(subject = %credential.subject, epoch, "Session authenticated");
        Ok(credential)
    }

    /// Read back a persisted credential on process start.
    ///
    /// An expired or unreadable credential is treated as absent and removed.
    pub fn restore(&self) -> Result<Option<Credential>, StorageError> {
        let stored = match self.state.storage().load() {
            Ok(stored) => stored,
            Err(StorageError::Corrupt(e)) => {
                tracing::warn!(error = %e, "Discarding corrupt persisted session");
                self.state.storage().clear()?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(credential) = stored else {
            return Ok(None);
        };
        if credential.is_expired_at(Utc::now()) {
            tracing::info!(subject = %credential.subject, "Persisted session expired, clearing");
            self.state.storage().clear()?;
            return Ok(None);
        }
        let epoch = self.state.adopt(credential.clone());
        tracing::info!(subject = %credential.subject, epoch, "Session restored");
        Ok(Some(credential))
    }

    /// Clear the credential everywhere. Calling it again is a no-op.
    pub fn logout(&self) {
        if self.state.end(SessionChange::LoggedOut) {
            tracing::info!(epoch = self.state.epoch(), "Session logged out");
        }
    }

    /// Synchronous read, never blocks.
    pub fn current_credential(&self) -> Option<Credential> {
        self.state.current()
    }

    pub fn subscribe(&self) -> SessionWatcher {
        self.state.subscribe()
    }
}
