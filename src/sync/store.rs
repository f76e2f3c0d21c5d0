//! Observable local collections.
//!
//! Readers get immutable `StoreView` snapshots through a watch channel; only
//! the sync engine writes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::CallError;
use crate::model::{Entity, EntityChange};

use super::reconcile::{Applied, Reconciler, RecordMap};

/// Why a collection may be behind the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degraded {
    /// A full re-fetch gave up after its retries.
    SnapshotFailed(CallError),
    /// The update stream has been down for at least this long.
    StreamDown(Duration),
}

impl fmt::Display for Degraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degraded::SnapshotFailed(e) => write!(f, "snapshot failed: {e}"),
            Degraded::StreamDown(d) => write!(f, "update stream down for {}s", d.as_secs()),
        }
    }
}

/// One published state of a collection.
#[derive(Debug, Clone)]
pub struct StoreView<E> {
    pub records: RecordMap<E>,
    pub degraded: Option<Degraded>,
    /// Bumped on every published change.
    pub revision: u64,
}

impl<E> StoreView<E> {
    pub fn get(&self, id: &str) -> Option<&Arc<E>> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read handle to one synced collection. Cheap to clone.
#[derive(Clone)]
pub struct ViewStore<E> {
    tx: Arc<watch::Sender<StoreView<E>>>,
}

impl<E: Entity> ViewStore<E> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(StoreView {
            records: Arc::new(BTreeMap::new()),
            degraded: None,
            revision: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView<E>> {
        self.tx.subscribe()
    }

    pub fn view(&self) -> StoreView<E> {
        self.tx.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<E>> {
        self.tx.borrow().records.get(id).cloned()
    }

    pub fn records(&self) -> Vec<Arc<E>> {
        self.tx.borrow().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn degraded(&self) -> Option<Degraded> {
        self.tx.borrow().degraded.clone()
    }

    pub fn revision(&self) -> u64 {
        self.tx.borrow().revision
    }

    pub(crate) fn publish(&self, records: RecordMap<E>) {
        self.tx.send_modify(|view| {
            view.records = records;
            view.revision += 1;
        });
    }

    pub(crate) fn set_degraded(&self, degraded: Option<Degraded>) {
        self.tx.send_if_modified(|view| {
            if view.degraded == degraded {
                return false;
            }
            view.degraded = degraded;
            view.revision += 1;
            true
        });
    }

    /// Clear the degraded flag only if it is of the given shape.
    pub(crate) fn clear_degraded_if(&self, matches: impl Fn(&Degraded) -> bool) {
        self.tx.send_if_modified(|view| {
            if !view.degraded.as_ref().is_some_and(&matches) {
                return false;
            }
            view.degraded = None;
            view.revision += 1;
            true
        });
    }
}

impl<E> fmt::Debug for ViewStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.tx.borrow();
        f.debug_struct("ViewStore")
            .field("len", &view.records.len())
            .field("revision", &view.revision)
            .field("degraded", &view.degraded)
            .finish()
    }
}

/// Reconciler paired with the store it publishes to.
pub(crate) struct Collection<E> {
    reconciler: Reconciler<E>,
    store: ViewStore<E>,
    retention: Duration,
}

impl<E: Entity> Collection<E> {
    pub(crate) fn new(store: ViewStore<E>, retention: Duration) -> Self {
        let records = store.view().records;
        Self {
            reconciler: Reconciler::with_records(records, retention),
            store,
            retention,
        }
    }

    pub(crate) fn store(&self) -> &ViewStore<E> {
        &self.store
    }

    pub(crate) fn reconciler(&self) -> &Reconciler<E> {
        &self.reconciler
    }

    /// Apply one change and publish if the collection moved.
    pub(crate) fn apply(&mut self, change: EntityChange<E>, now: Instant) -> Applied {
        let applied = self.reconciler.apply(change, now);
        if applied.changed() {
            self.store.publish(self.reconciler.records().clone());
        }
        applied
    }

    /// Apply a whole page and publish once.
    pub(crate) fn apply_page(&mut self, records: Vec<E>, now: Instant) -> usize {
        self.reconciler.prune_tombstones(now);
        let mut changed = 0;
        for record in records {
            if self.reconciler.upsert(record, now).changed() {
                changed += 1;
            }
        }
        if changed > 0 {
            self.store.publish(self.reconciler.records().clone());
        }
        changed
    }

    pub(crate) fn retain<F>(&mut self, keep: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let removed = self.reconciler.retain(keep);
        if !removed.is_empty() {
            self.store.publish(self.reconciler.records().clone());
        }
        removed
    }

    /// Drop everything, e.g. when a different subject logs in.
    pub(crate) fn reset(&mut self) {
        self.reconciler = Reconciler::new(self.retention);
        self.store.publish(self.reconciler.records().clone());
        self.store.set_degraded(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sbom;
    use chrono::Utc;

    fn sbom(id: &str, version: u64) -> Sbom {
        Sbom {
            id: id.to_string(),
            name: id.to_string(),
            format: "spdx".to_string(),
            version,
            content: String::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_page_publishes_once() {
        let store = ViewStore::<Sbom>::new();
        let mut rx = store.subscribe();
        let mut collection = Collection::new(store.clone(), Duration::from_secs(60));

        let changed = collection.apply_page(vec![sbom("a", 1), sbom("b", 1)], Instant::now());
        assert_eq!(changed, 2);
        assert!(rx.has_changed().unwrap());
        let view = rx.borrow_and_update().clone();
        assert_eq!(view.len(), 2);
        assert_eq!(view.revision, 1);
    }

    #[tokio::test]
    async fn test_stale_change_does_not_publish() {
        let store = ViewStore::<Sbom>::new();
        let mut collection = Collection::new(store.clone(), Duration::from_secs(60));
        let now = Instant::now();
        collection.apply(EntityChange::Upsert(sbom("a", 2)), now);
        let revision = store.revision();
        assert!(!collection.apply(EntityChange::Upsert(sbom("a", 1)), now).changed());
        assert_eq!(store.revision(), revision);
    }

    #[tokio::test]
    async fn test_stream_path_prunes_expired_tombstones() {
        let store = ViewStore::<Sbom>::new();
        let mut collection = Collection::new(store, Duration::from_secs(300));
        let start = Instant::now();
        for i in 0..20u64 {
            let change = EntityChange::Delete {
                id: format!("gone-{i}"),
                version: 1,
            };
            collection.apply(change, start + Duration::from_secs(60 * i));
        }
        assert!(collection.reconciler().tombstone_count() <= 8);
    }

    #[test]
    fn test_degraded_flag_set_and_cleared() {
        let store = ViewStore::<Sbom>::new();
        store.set_degraded(Some(Degraded::StreamDown(Duration::from_secs(61))));
        assert!(store.degraded().is_some());
        store.clear_degraded_if(|d| matches!(d, Degraded::SnapshotFailed(_)));
        assert!(store.degraded().is_some());
        store.clear_degraded_if(|d| matches!(d, Degraded::StreamDown(_)));
        assert!(store.degraded().is_none());
    }

    #[test]
    fn test_collection_resumes_from_published_records() {
        let store = ViewStore::<Sbom>::new();
        let mut first = Collection::new(store.clone(), Duration::from_secs(60));
        first.apply(EntityChange::Upsert(sbom("a", 3)), Instant::now());

        let mut second = Collection::new(store.clone(), Duration::from_secs(60));
        assert_eq!(second.reconciler().len(), 1);
        assert!(!second
            .apply(EntityChange::Upsert(sbom("a", 2)), Instant::now())
            .changed());
        second.reset();
        assert!(store.is_empty());
    }
}
