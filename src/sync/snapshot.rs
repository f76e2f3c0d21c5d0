//! Paginated full re-fetch of every synced entity type.
//!
//! Runs as its own task and reports over a channel; every message carries
//! the tag of the stream session and connection it was started for, so the
//! engine can drop results that arrive after the session moved on.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::TraceGuardClient;
use crate::error::CallError;
use crate::model::{Entity, EntityKind, Page, ProvenanceRecord, Sbom};

use super::backoff::BackoffPolicy;

/// Identifies one fetch: stream session generation plus the connection
/// counter within that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchTag {
    pub generation: u64,
    pub fetch: u64,
}

#[derive(Debug)]
pub(crate) enum Batch {
    Sboms(Vec<Sbom>),
    Provenance(Vec<ProvenanceRecord>),
}

impl Batch {
    pub(crate) fn kind(&self) -> EntityKind {
        match self {
            Batch::Sboms(_) => EntityKind::Sbom,
            Batch::Provenance(_) => EntityKind::Provenance,
        }
    }
}

/// How a completed listing of one kind went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Listing {
    /// `total` held across every page: a record missing from the pages is
    /// missing on the backend.
    Stable,
    /// `total` moved between pages. Offset paging may have skipped records.
    Shifted,
}

#[derive(Debug)]
pub(crate) enum SnapshotMessage {
    Page { tag: FetchTag, batch: Batch },
    /// Every page of `kind` has been delivered, or the fetch gave up.
    Finished {
        tag: FetchTag,
        kind: EntityKind,
        result: Result<Listing, CallError>,
    },
}

impl SnapshotMessage {
    pub(crate) fn tag(&self) -> FetchTag {
        match self {
            SnapshotMessage::Page { tag, .. } | SnapshotMessage::Finished { tag, .. } => *tag,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SnapshotFetcher {
    pub client: TraceGuardClient,
    pub page_size: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl SnapshotFetcher {
    pub(crate) fn spawn(
        self,
        tag: FetchTag,
        tx: mpsc::Sender<SnapshotMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(
                generation = tag.generation,
                fetch = tag.fetch,
                "Snapshot fetch started"
            );
            for kind in EntityKind::ALL {
                let result = match kind {
                    EntityKind::Sbom => self.fetch_all::<Sbom>(tag, &tx, Batch::Sboms).await,
                    EntityKind::Provenance => {
                        self.fetch_all::<ProvenanceRecord>(tag, &tx, Batch::Provenance)
                            .await
                    }
                };
                let result = match result {
                    Ok(Some(listing)) => Ok(listing),
                    Ok(None) => return,
                    Err(e) => Err(e),
                };
                if tx
                    .send(SnapshotMessage::Finished { tag, kind, result })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        })
    }

    /// Deliver every page of `E`. `Ok(None)` means the engine stopped
    /// listening.
    async fn fetch_all<E: Entity>(
        &self,
        tag: FetchTag,
        tx: &mpsc::Sender<SnapshotMessage>,
        wrap: fn(Vec<E>) -> Batch,
    ) -> Result<Option<Listing>, CallError> {
        let page_size = self.page_size.max(1);
        let mut page = 1u32;
        let mut first_total = None;
        let mut listing = Listing::Stable;
        loop {
            let Page { records, total } = self.fetch_page::<E>(page, page_size).await?;
            if *first_total.get_or_insert(total) != total {
                listing = Listing::Shifted;
            }
            let count = records.len();
            if tx
                .send(SnapshotMessage::Page {
                    tag,
                    batch: wrap(records),
                })
                .await
                .is_err()
            {
                return Ok(None);
            }
            if count == 0 || u64::from(page) * u64::from(page_size) >= total {
                tracing::debug!(
                    kind = %E::KIND,
                    pages = page,
                    total,
                    ?listing,
                    "Snapshot kind complete"
                );
                return Ok(Some(listing));
            }
            page += 1;
        }
    }

    async fn fetch_page<E: Entity>(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<E>, CallError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.list::<E>(page, page_size).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        kind = %E::KIND,
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Snapshot page failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        kind = %E::KIND,
                        page,
                        attempt,
                        error = %e,
                        "Snapshot page failed, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}
