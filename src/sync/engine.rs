//! LiveSyncEngine - keeps the local stores converged with the backend.
//!
//! One supervisor task follows the session. Each authenticated session gets
//! its own stream session (new generation, attempt counter at zero) that
//! cycles through `Connecting -> Open -> Backoff -> Connecting ...` until the
//! session changes or the engine is stopped. Every transition to `Open`
//! starts a full paginated re-fetch that runs alongside the stream; both
//! sources feed the same reconcilers.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::client::TraceGuardClient;
use crate::gateway::{CallGateway, CloseReason, EventStream, StreamEnd, StreamFrame};
use crate::model::{EntityKind, ProvenanceRecord, Sbom, UpdateEvent};
use crate::session::{SessionState, SessionWatcher};

use super::backoff::BackoffPolicy;
use super::snapshot::{Batch, FetchTag, Listing, SnapshotFetcher, SnapshotMessage};
use super::store::{Collection, Degraded, ViewStore};

/// Connection state of the update stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No credential yet, or the engine has not started.
    Idle,
    Connecting,
    Open,
    /// Waiting `delay` before the next connect attempt.
    Backoff { delay: Duration },
    Closed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Connecting => "connecting",
            SyncState::Open => "open",
            SyncState::Backoff { .. } => "backoff",
            SyncState::Closed => "closed",
        }
    }
}

/// Published engine status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub generation: u64,
    pub attempt: u32,
    pub state: SyncState,
    /// Identifiers reconciled since the current stream session opened.
    pub reconciled: usize,
}

/// Every state change, in order. Unlike `EngineStatus` nothing is coalesced
/// as long as the receiver keeps up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTransition {
    pub generation: u64,
    pub attempt: u32,
    pub state: SyncState,
}

/// Runtime knobs; see `SyncConfig` for the file/env representation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub backoff: BackoffPolicy,
    pub page_size: u32,
    pub snapshot_max_attempts: u32,
    pub tombstone_retention: Duration,
    /// Flag stores degraded after the stream has been down this long.
    pub degraded_after: Duration,
    /// Periodic full re-fetch while open. `None` disables it.
    pub refresh_interval: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            page_size: 50,
            snapshot_max_attempts: 5,
            tombstone_retention: Duration::from_secs(300),
            degraded_after: Duration::from_secs(60),
            refresh_interval: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Refresh,
    Stop,
}

/// Owns the stores; `start` hands back the handle that drives them.
pub struct LiveSyncEngine {
    client: TraceGuardClient,
    session: SessionState,
    options: SyncOptions,
    sboms: ViewStore<Sbom>,
    provenance: ViewStore<ProvenanceRecord>,
}

impl LiveSyncEngine {
    pub fn new(gateway: CallGateway, options: SyncOptions) -> Self {
        let session = gateway.session().clone();
        Self {
            client: TraceGuardClient::new(gateway),
            session,
            options,
            sboms: ViewStore::new(),
            provenance: ViewStore::new(),
        }
    }

    pub fn sboms(&self) -> ViewStore<Sbom> {
        self.sboms.clone()
    }

    pub fn provenance(&self) -> ViewStore<ProvenanceRecord> {
        self.provenance.clone()
    }

    /// Spawn the supervisor on the current runtime.
    pub fn start(self) -> EngineHandle {
        let (status_tx, status_rx) = watch::channel(EngineStatus {
            generation: 0,
            attempt: 0,
            state: SyncState::Idle,
            reconciled: 0,
        });
        let (transitions, _) = broadcast::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(64);

        let sboms = self.sboms.clone();
        let provenance = self.provenance.clone();
        let session_rx = self.session.subscribe();
        let supervisor = Supervisor {
            fetcher: SnapshotFetcher {
                client: self.client.clone(),
                page_size: self.options.page_size,
                max_attempts: self.options.snapshot_max_attempts.max(1),
                backoff: self.options.backoff,
            },
            sboms: Collection::new(self.sboms, self.options.tombstone_retention),
            provenance: Collection::new(self.provenance, self.options.tombstone_retention),
            client: self.client,
            session: self.session,
            options: self.options,
            status: status_tx,
            transitions: transitions.clone(),
            commands: commands_rx,
            session_rx,
            snapshot_tx,
            snapshot_rx,
            generation: 0,
            last_subject: None,
        };
        let task = tokio::spawn(supervisor.run());

        EngineHandle {
            status: status_rx,
            transitions,
            commands: commands_tx,
            sboms,
            provenance,
            task,
        }
    }
}

/// Control and read surface of a running engine.
pub struct EngineHandle {
    status: watch::Receiver<EngineStatus>,
    transitions: broadcast::Sender<SyncTransition>,
    commands: mpsc::Sender<Command>,
    sboms: ViewStore<Sbom>,
    provenance: ViewStore<ProvenanceRecord>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn transitions(&self) -> broadcast::Receiver<SyncTransition> {
        self.transitions.subscribe()
    }

    pub fn sboms(&self) -> &ViewStore<Sbom> {
        &self.sboms
    }

    pub fn provenance(&self) -> &ViewStore<ProvenanceRecord> {
        &self.provenance
    }

    /// Ask for a full re-fetch. Ignored unless the stream is open.
    pub async fn refresh(&self) -> bool {
        self.commands.send(Command::Refresh).await.is_ok()
    }

    /// Close the stream and wait for the supervisor to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Stop).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sync supervisor ended abnormally");
        }
    }
}

/// Per-authentication stream state. Dropped on teardown.
struct StreamSession {
    generation: u64,
    epoch: u64,
    subject: String,
    attempt: u32,
    fetches: u64,
    reconciled: HashSet<(EntityKind, String)>,
    down_since: Option<Instant>,
}

/// Full re-fetch in progress for the current connection.
struct ActiveFetch {
    tag: FetchTag,
    task: JoinHandle<()>,
    /// Identifiers delivered by snapshot pages, per kind.
    seen: HashSet<(EntityKind, String)>,
    /// Identifiers touched by stream events since the fetch started.
    touched: HashSet<(EntityKind, String)>,
}

/// Why the open loop or a backoff wait returned.
enum Exit {
    Reconnect,
    SessionChanged,
    Stop,
}

struct Supervisor {
    client: TraceGuardClient,
    session: SessionState,
    options: SyncOptions,
    fetcher: SnapshotFetcher,
    sboms: Collection<Sbom>,
    provenance: Collection<ProvenanceRecord>,
    status: watch::Sender<EngineStatus>,
    transitions: broadcast::Sender<SyncTransition>,
    commands: mpsc::Receiver<Command>,
    session_rx: SessionWatcher,
    snapshot_tx: mpsc::Sender<SnapshotMessage>,
    snapshot_rx: mpsc::Receiver<SnapshotMessage>,
    generation: u64,
    last_subject: Option<String>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let status = self.session_rx.borrow_and_update().clone();
            let Some(credential) = status.credential else {
                if !self.wait_for_session().await {
                    break;
                }
                continue;
            };

            if self
                .last_subject
                .as_deref()
                .is_some_and(|previous| previous != credential.subject)
            {
                tracing::info!(
                    subject = %credential.subject,
                    "Subject changed, clearing local stores"
                );
                self.sboms.reset();
                self.provenance.reset();
            }
            self.last_subject = Some(credential.subject.clone());

            self.generation += 1;
            let mut stream_session = StreamSession {
                generation: self.generation,
                epoch: status.epoch,
                subject: credential.subject,
                attempt: 0,
                fetches: 0,
                reconciled: HashSet::new(),
                down_since: None,
            };
            tracing::info!(
                generation = stream_session.generation,
                subject = %stream_session.subject,
                "Stream session started"
            );

            let exit = self.run_session(&mut stream_session).await;
            self.transition(&stream_session, SyncState::Closed);
            if matches!(exit, Exit::Stop) {
                break;
            }
        }
        tracing::info!("Sync supervisor stopped");
    }

    /// Block until a session change. `false` means stop.
    async fn wait_for_session(&mut self) -> bool {
        loop {
            tokio::select! {
                changed = self.session_rx.changed() => return changed.is_ok(),
                command = self.commands.recv() => match command {
                    None | Some(Command::Stop) => return false,
                    Some(Command::Refresh) => {
                        tracing::debug!("Refresh ignored, no session");
                    }
                },
                Some(message) = self.snapshot_rx.recv() => {
                    tracing::debug!(
                        tag = ?message.tag(),
                        "Dropping snapshot result from an ended session"
                    );
                }
            }
        }
    }

    async fn run_session(&mut self, ss: &mut StreamSession) -> Exit {
        loop {
            if self.session.epoch() != ss.epoch {
                return Exit::SessionChanged;
            }
            self.transition(ss, SyncState::Connecting);
            match self.client.stream_updates(&ss.subject).await {
                Ok(stream) => {
                    ss.attempt = 0;
                    ss.down_since = None;
                    self.transition(ss, SyncState::Open);
                    let stream_down = |d: &Degraded| matches!(d, Degraded::StreamDown(_));
                    self.sboms.store().clear_degraded_if(stream_down);
                    self.provenance.store().clear_degraded_if(stream_down);
                    match self.run_open(ss, stream).await {
                        Exit::Reconnect => {}
                        other => return other,
                    }
                }
                Err(e) if e.is_auth() => {
                    tracing::warn!(
                        generation = ss.generation,
                        error = %e,
                        "Stream rejected credential"
                    );
                    return Exit::SessionChanged;
                }
                Err(e) => {
                    tracing::warn!(
                        generation = ss.generation,
                        attempt = ss.attempt,
                        error = %e,
                        "Failed to open update stream"
                    );
                }
            }

            if self.session.epoch() != ss.epoch {
                return Exit::SessionChanged;
            }
            match self.back_off(ss).await {
                Exit::Reconnect => {}
                other => return other,
            }
        }
    }

    async fn run_open(
        &mut self,
        ss: &mut StreamSession,
        mut stream: EventStream<UpdateEvent>,
    ) -> Exit {
        let cancel = stream.cancel_handle();
        let mut fetch = Some(self.start_fetch(ss));
        let mut ticker = self.options.refresh_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let exit = loop {
            tokio::select! {
                biased;
                changed = self.session_rx.changed() => {
                    if changed.is_err() || self.session_rx.borrow_and_update().epoch != ss.epoch {
                        break Exit::SessionChanged;
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Stop) => break Exit::Stop,
                    Some(Command::Refresh) => {
                        tracing::info!(generation = ss.generation, "Full re-fetch requested");
                        supersede(&mut fetch, self.start_fetch(ss));
                    }
                },
                frame = stream.next() => match frame {
                    StreamFrame::Event(event) => {
                        if self.session.epoch() != ss.epoch {
                            break Exit::SessionChanged;
                        }
                        self.apply_event(ss, fetch.as_mut(), event);
                    }
                    StreamFrame::Skipped(e) => {
                        tracing::warn!(
                            generation = ss.generation,
                            error = %e,
                            "Skipping undecodable update"
                        );
                    }
                    StreamFrame::End(StreamEnd::Cancelled) => break Exit::Stop,
                    StreamFrame::End(StreamEnd::Closed(reason)) => {
                        match &reason {
                            CloseReason::EndOfStream => {
                                tracing::info!(
                                    generation = ss.generation,
                                    "Update stream ended by server"
                                );
                            }
                            CloseReason::Failed(e) => {
                                tracing::warn!(
                                    generation = ss.generation,
                                    error = %e,
                                    "Update stream failed"
                                );
                            }
                        }
                        break Exit::Reconnect;
                    }
                },
                Some(message) = self.snapshot_rx.recv() => {
                    if self.session.epoch() != ss.epoch {
                        break Exit::SessionChanged;
                    }
                    self.on_snapshot(ss, &mut fetch, message);
                }
                _ = tick(&mut ticker) => {
                    tracing::debug!(generation = ss.generation, "Periodic full re-fetch");
                    supersede(&mut fetch, self.start_fetch(ss));
                }
            }
        };

        cancel.cancel();
        drop(stream);
        if let Some(active) = fetch.take() {
            // A reconnect re-fetches anyway; on logout the fetch may finish
            // but its results no longer match any tag.
            if matches!(exit, Exit::Reconnect | Exit::Stop) {
                active.task.abort();
            }
        }
        exit
    }

    async fn back_off(&mut self, ss: &mut StreamSession) -> Exit {
        ss.attempt += 1;
        let now = Instant::now();
        let down_since = *ss.down_since.get_or_insert(now);
        let delay = self.options.backoff.delay(ss.attempt);
        self.transition(ss, SyncState::Backoff { delay });

        let wake = now + delay;
        let degraded_at = down_since + self.options.degraded_after;
        let mut flagged = false;
        loop {
            if !flagged && Instant::now() >= degraded_at {
                let down = Instant::now().saturating_duration_since(down_since);
                tracing::warn!(
                    generation = ss.generation,
                    down_secs = down.as_secs(),
                    "Update stream down, marking stores degraded"
                );
                self.sboms.store().set_degraded(Some(Degraded::StreamDown(down)));
                self.provenance.store().set_degraded(Some(Degraded::StreamDown(down)));
                flagged = true;
            }
            let until = if flagged { wake } else { wake.min(degraded_at) };
            tokio::select! {
                biased;
                changed = self.session_rx.changed() => {
                    if changed.is_err() || self.session_rx.borrow_and_update().epoch != ss.epoch {
                        return Exit::SessionChanged;
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Stop) => return Exit::Stop,
                    Some(Command::Refresh) => {
                        tracing::debug!("Refresh ignored while backing off");
                    }
                },
                Some(message) = self.snapshot_rx.recv() => {
                    tracing::debug!(
                        tag = ?message.tag(),
                        "Dropping snapshot result outside an open stream"
                    );
                }
                _ = tokio::time::sleep_until(until) => {
                    if Instant::now() >= wake {
                        return Exit::Reconnect;
                    }
                }
            }
        }
    }

    fn start_fetch(&mut self, ss: &mut StreamSession) -> ActiveFetch {
        ss.fetches += 1;
        let tag = FetchTag {
            generation: ss.generation,
            fetch: ss.fetches,
        };
        ActiveFetch {
            tag,
            task: self.fetcher.clone().spawn(tag, self.snapshot_tx.clone()),
            seen: HashSet::new(),
            touched: HashSet::new(),
        }
    }

    fn apply_event(
        &mut self,
        ss: &mut StreamSession,
        fetch: Option<&mut ActiveFetch>,
        event: UpdateEvent,
    ) {
        let now = Instant::now();
        let kind = event.entity_type;
        let id = event.id.clone();
        let version = event.version;
        let applied = match kind {
            EntityKind::Sbom => event.into_change::<Sbom>().map(|c| self.sboms.apply(c, now)),
            EntityKind::Provenance => event
                .into_change::<ProvenanceRecord>()
                .map(|c| self.provenance.apply(c, now)),
        };
        match applied {
            Ok(applied) => {
                tracing::trace!(%kind, %id, version, ?applied, "Applied stream update");
                if let Some(fetch) = fetch {
                    fetch.touched.insert((kind, id.clone()));
                }
                if ss.reconciled.insert((kind, id)) {
                    self.publish_reconciled(ss);
                }
            }
            Err(e) => {
                tracing::warn!(%kind, %id, version, error = %e, "Skipping malformed update");
            }
        }
    }

    fn on_snapshot(
        &mut self,
        ss: &mut StreamSession,
        fetch: &mut Option<ActiveFetch>,
        message: SnapshotMessage,
    ) {
        let Some(active) = fetch.as_mut().filter(|f| f.tag == message.tag()) else {
            tracing::debug!(tag = ?message.tag(), "Dropping stale snapshot result");
            return;
        };
        let now = Instant::now();
        match message {
            SnapshotMessage::Page { batch, .. } => {
                let kind = batch.kind();
                let ids: Vec<String> = match batch {
                    Batch::Sboms(records) => {
                        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
                        self.sboms.apply_page(records, now);
                        ids
                    }
                    Batch::Provenance(records) => {
                        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
                        self.provenance.apply_page(records, now);
                        ids
                    }
                };
                let before = ss.reconciled.len();
                for id in ids {
                    active.seen.insert((kind, id.clone()));
                    ss.reconciled.insert((kind, id));
                }
                if ss.reconciled.len() != before {
                    self.publish_reconciled(ss);
                }
            }
            SnapshotMessage::Finished {
                kind,
                result: Ok(listing),
                ..
            } => {
                if listing == Listing::Stable {
                    self.sweep(kind, active);
                } else {
                    tracing::info!(%kind, "Listing shifted while paging, keeping unseen records");
                }
                let snapshot_failed = |d: &Degraded| matches!(d, Degraded::SnapshotFailed(_));
                match kind {
                    EntityKind::Sbom => self.sboms.store().clear_degraded_if(snapshot_failed),
                    EntityKind::Provenance => {
                        self.provenance.store().clear_degraded_if(snapshot_failed)
                    }
                }
            }
            SnapshotMessage::Finished { kind, result: Err(e), .. } => {
                tracing::warn!(
                    %kind,
                    error = %e,
                    "Snapshot fetch exhausted retries, marking degraded"
                );
                let degraded = Some(Degraded::SnapshotFailed(e));
                match kind {
                    EntityKind::Sbom => self.sboms.store().set_degraded(degraded),
                    EntityKind::Provenance => self.provenance.store().set_degraded(degraded),
                }
            }
        }
    }

    /// Drop records of `kind` that the finished fetch neither delivered nor
    /// saw touched by the stream while it ran.
    fn sweep(&mut self, kind: EntityKind, fetch: &ActiveFetch) {
        let keep = |id: &str| {
            let key = (kind, id.to_string());
            fetch.seen.contains(&key) || fetch.touched.contains(&key)
        };
        let removed = match kind {
            EntityKind::Sbom => self.sboms.retain(keep),
            EntityKind::Provenance => self.provenance.retain(keep),
        };
        if !removed.is_empty() {
            tracing::info!(
                %kind,
                removed = removed.len(),
                "Removed records missing from snapshot"
            );
        }
    }

    fn transition(&self, ss: &StreamSession, state: SyncState) {
        let changed = self.status.send_if_modified(|status| {
            let next = EngineStatus {
                generation: ss.generation,
                attempt: ss.attempt,
                state,
                reconciled: ss.reconciled.len(),
            };
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
        if !changed {
            return;
        }
        tracing::debug!(
            generation = ss.generation,
            attempt = ss.attempt,
            state = state.as_str(),
            "Sync state transition"
        );
        let _ = self.transitions.send(SyncTransition {
            generation: ss.generation,
            attempt: ss.attempt,
            state,
        });
    }

    fn publish_reconciled(&self, ss: &StreamSession) {
        self.status.send_if_modified(|status| {
            if status.generation != ss.generation {
                return false;
            }
            status.reconciled = ss.reconciled.len();
            true
        });
    }
}

fn supersede(slot: &mut Option<ActiveFetch>, next: ActiveFetch) {
    if let Some(previous) = slot.replace(next) {
        previous.task.abort();
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
