//! Shared fixtures: an in-memory TraceGuard backend behind the in-process
//! transport, plus helpers for paused-time tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};

use traceguard_sync::client::{ops, ListRequest, LoginRequest, LoginResponse};
use traceguard_sync::gateway::inprocess::{InProcessTransport, StreamFeed};
use traceguard_sync::gateway::{Metadata, TransportError, TransportStatus, AUTHORIZATION_KEY};
use traceguard_sync::model::{Entity, EntityKind, ProvenanceRecord, Sbom};
use traceguard_sync::session::MemoryCredentialStorage;
use traceguard_sync::sync::{BackoffPolicy, EngineHandle, SyncOptions, SyncTransition};
use traceguard_sync::{CallGateway, Credential, LiveSyncEngine, SessionManager, SessionState};

/// Generous virtual-time bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(600);

pub fn sbom(id: &str, version: u64) -> Sbom {
    Sbom {
        id: id.to_string(),
        name: format!("{id}-service"),
        format: "cyclonedx-json".to_string(),
        version,
        content: format!("{{\"bomFormat\":\"CycloneDX\",\"version\":{version}}}"),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
    }
}

pub fn provenance(id: &str, version: u64) -> ProvenanceRecord {
    ProvenanceRecord {
        id: id.to_string(),
        artifact_id: format!("ghcr.io/acme/{id}@sha256:00ff"),
        slsa_level: 3,
        metadata: BTreeMap::from([("builder".to_string(), "github-actions".to_string())]),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        version: Some(version),
    }
}

#[derive(Default)]
struct BackendState {
    users: HashMap<String, String>,
    tokens: HashSet<String>,
    issued: u64,
    sboms: BTreeMap<String, Sbom>,
    provenance: BTreeMap<String, ProvenanceRecord>,
    scripted: HashMap<EntityKind, VecDeque<Value>>,
    list_failures: VecDeque<TransportError>,
    list_calls: Vec<(EntityKind, u32)>,
}

/// In-memory backend serving login, list and stream operations.
pub struct FakeBackend {
    pub transport: Arc<InProcessTransport>,
    state: Arc<Mutex<BackendState>>,
    feeds: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamFeed>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let transport = Arc::new(InProcessTransport::new());
        let feeds = transport.take_stream_feeds().unwrap();
        let state = Arc::new(Mutex::new(BackendState::default()));
        {
            let mut s = lock(&state);
            s.users.insert("alice".to_string(), "secret".to_string());
            s.users.insert("bob".to_string(), "hunter2".to_string());
        }

        let login_state = state.clone();
        transport.on_unary_json(ops::LOGIN, move |_, request: LoginRequest| {
            if request.username == "down" {
                return Err(TransportError::unavailable("auth service down"));
            }
            let mut s = lock(&login_state);
            if s.users.get(&request.username) != Some(&request.password) {
                return Err(TransportError::new(
                    TransportStatus::Unauthenticated,
                    "invalid username or password",
                ));
            }
            s.issued += 1;
            let token = format!("tok-{}-{}", request.username, s.issued);
            s.tokens.insert(token.clone());
            Ok(LoginResponse {
                token,
                subject: Some(request.username),
                expires_at: None,
            })
        });

        for (operation, kind) in [
            (ops::LIST_SBOMS, EntityKind::Sbom),
            (ops::LIST_PROVENANCE, EntityKind::Provenance),
        ] {
            let list_state = state.clone();
            transport.on_unary_json(operation, move |metadata, request: ListRequest| {
                assert_eq!(request.entity_type, kind);
                let mut s = lock(&list_state);
                authorize(&s, metadata)?;
                s.list_calls.push((kind, request.page));
                if let Some(error) = s.list_failures.pop_front() {
                    return Err(error);
                }
                if let Some(page) = s.scripted.get_mut(&kind).and_then(|q| q.pop_front()) {
                    return Ok(page);
                }
                let all: Vec<Value> = match kind {
                    EntityKind::Sbom => s.sboms.values().map(to_value).collect(),
                    EntityKind::Provenance => s.provenance.values().map(to_value).collect(),
                };
                let size = request.page_size.max(1) as usize;
                let start = (request.page.max(1) as usize - 1) * size;
                let records: Vec<Value> = all.iter().skip(start).take(size).cloned().collect();
                Ok(json!({ "records": records, "total": all.len() }))
            });
        }

        Self {
            transport,
            state,
            feeds: tokio::sync::Mutex::new(feeds),
        }
    }

    pub fn gateway(&self, session: SessionState) -> CallGateway {
        CallGateway::new(self.transport.clone(), session)
    }

    pub fn issue_token(&self, token: &str) {
        lock(&self.state).tokens.insert(token.to_string());
    }

    pub fn revoke_all_tokens(&self) {
        lock(&self.state).tokens.clear();
    }

    pub fn put_sbom(&self, record: Sbom) {
        lock(&self.state).sboms.insert(record.id.clone(), record);
    }

    pub fn remove_sbom(&self, id: &str) {
        lock(&self.state).sboms.remove(id);
    }

    pub fn put_provenance(&self, record: ProvenanceRecord) {
        lock(&self.state).provenance.insert(record.id.clone(), record);
    }

    /// Serve this page for the next list call of `E`, ahead of live state.
    pub fn script_page<E: Entity>(&self, records: Vec<E>, total: u64) {
        lock(&self.state)
            .scripted
            .entry(E::KIND)
            .or_default()
            .push_back(json!({ "records": records, "total": total }));
    }

    /// Fail the next `count` list calls with `status`.
    pub fn fail_lists(&self, count: usize, status: TransportStatus) {
        let mut s = lock(&self.state);
        for _ in 0..count {
            s.list_failures
                .push_back(TransportError::new(status, "scripted list failure"));
        }
    }

    pub fn list_calls(&self) -> Vec<(EntityKind, u32)> {
        lock(&self.state).list_calls.clone()
    }

    /// Next stream opened by a client.
    pub async fn next_feed(&self) -> StreamFeed {
        let mut feeds = self.feeds.lock().await;
        tokio::time::timeout(WAIT, feeds.recv())
            .await
            .expect("no stream opened in time")
            .expect("transport dropped")
    }

    pub fn try_next_feed(&self) -> Option<StreamFeed> {
        self.feeds.try_lock().ok()?.try_recv().ok()
    }
}

fn authorize(state: &BackendState, metadata: &Metadata) -> Result<(), TransportError> {
    let token = metadata
        .get(AUTHORIZATION_KEY)
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(token) if state.tokens.contains(token) => Ok(()),
        _ => Err(TransportError::new(
            TransportStatus::Unauthenticated,
            "missing or revoked token",
        )),
    }
}

fn to_value<T: serde::Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Backend plus one client wired to it.
pub struct Harness {
    pub backend: FakeBackend,
    pub storage: Arc<MemoryCredentialStorage>,
    pub session: SessionState,
    pub gateway: CallGateway,
    pub sessions: SessionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_storage(Arc::new(MemoryCredentialStorage::new()))
    }

    pub fn with_storage(storage: Arc<MemoryCredentialStorage>) -> Self {
        let backend = FakeBackend::new();
        let session = SessionState::new(storage.clone());
        let gateway = backend.gateway(session.clone());
        let sessions = SessionManager::new(gateway.clone());
        Self {
            backend,
            storage,
            session,
            gateway,
            sessions,
        }
    }

    pub async fn login(&self, username: &str) -> Credential {
        let password = match username {
            "alice" => "secret",
            "bob" => "hunter2",
            other => panic!("no fixture user {other}"),
        };
        self.sessions
            .login(&LoginRequest::new(username, password))
            .await
            .unwrap()
    }

    pub fn engine(&self, options: SyncOptions) -> EngineHandle {
        LiveSyncEngine::new(self.gateway.clone(), options).start()
    }
}

/// Deterministic options for engine tests: no jitter, small pages.
pub fn test_options() -> SyncOptions {
    SyncOptions {
        backoff: BackoffPolicy::default().without_jitter(),
        page_size: 2,
        snapshot_max_attempts: 3,
        ..SyncOptions::default()
    }
}

/// Let runnable tasks and timers due in the next few virtual seconds run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}

pub async fn wait_until<T, F>(rx: &mut watch::Receiver<T>, mut predicate: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, rx.wait_for(|value| predicate(value)))
        .await
        .expect("condition not reached in time")
        .expect("sender dropped")
        .clone()
}

/// Pull transitions until one matches, returning everything seen.
pub async fn transitions_until<F>(
    rx: &mut broadcast::Receiver<SyncTransition>,
    mut predicate: F,
) -> Vec<SyncTransition>
where
    F: FnMut(&SyncTransition) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let transition = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("transition not reached in time")
            .expect("transition log closed or lagged");
        let done = predicate(&transition);
        seen.push(transition);
        if done {
            return seen;
        }
    }
}
