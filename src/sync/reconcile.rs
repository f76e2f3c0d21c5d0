//! Version-ordered merge of snapshot pages and stream events.
//!
//! Both sources feed the same `Reconciler`, so whichever copy of a record
//! carries the higher version wins regardless of arrival order. Deletes leave
//! a tombstone for `retention` so an older upsert arriving late cannot
//! resurrect the record. Tombstones past the window are pruned as changes
//! arrive, at most once per half window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::{Entity, EntityChange};

/// Records keyed by identifier, shared with readers without copying.
pub type RecordMap<E> = Arc<BTreeMap<String, Arc<E>>>;

/// Result of applying one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Removed,
    /// Delete for an identifier not currently held; only the tombstone moved.
    Tombstoned,
    /// Not newer than what is already known.
    Stale,
    /// Upsert at or below the version of a live tombstone.
    Buried,
}

impl Applied {
    /// Whether the visible collection changed.
    pub fn changed(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Replaced | Applied::Removed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    at: Instant,
}

#[derive(Debug)]
pub struct Reconciler<E> {
    records: RecordMap<E>,
    tombstones: HashMap<String, Tombstone>,
    retention: Duration,
    pruned_at: Option<Instant>,
}

impl<E: Entity> Reconciler<E> {
    pub fn new(retention: Duration) -> Self {
        Self::with_records(Arc::new(BTreeMap::new()), retention)
    }

    /// Continue from an already published collection.
    pub fn with_records(records: RecordMap<E>, retention: Duration) -> Self {
        Self {
            records,
            tombstones: HashMap::new(),
            retention,
            pruned_at: None,
        }
    }

    pub fn records(&self) -> &RecordMap<E> {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&Arc<E>> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn apply(&mut self, change: EntityChange<E>, now: Instant) -> Applied {
        self.prune_if_due(now);
        match change {
            EntityChange::Upsert(record) => self.upsert(record, now),
            EntityChange::Delete { id, version } => self.delete(&id, version, now),
        }
    }

    /// Insert or replace when `record` is strictly newer than what is held.
    pub fn upsert(&mut self, record: E, now: Instant) -> Applied {
        let id = record.id().to_string();
        if let Some(tombstone) = self.live_tombstone(&id, now) {
            if record.version() <= tombstone.version {
                return Applied::Buried;
            }
            self.tombstones.remove(&id);
        }
        let applied = match self.records.get(&id) {
            Some(existing) if existing.version() >= record.version() => return Applied::Stale,
            Some(_) => Applied::Replaced,
            None => Applied::Inserted,
        };
        Arc::make_mut(&mut self.records).insert(id, Arc::new(record));
        applied
    }

    /// Remove `id` unless the held record is newer than `version`.
    pub fn delete(&mut self, id: &str, version: u64, now: Instant) -> Applied {
        if let Some(existing) = self.records.get(id) {
            if existing.version() > version {
                return Applied::Stale;
            }
            Arc::make_mut(&mut self.records).remove(id);
            self.bury(id, version, now);
            return Applied::Removed;
        }
        match self.live_tombstone(id, now) {
            Some(tombstone) if tombstone.version >= version => Applied::Stale,
            _ => {
                self.bury(id, version, now);
                Applied::Tombstoned
            }
        }
    }

    /// Remove every record whose identifier fails `keep`. Returns the removed
    /// identifiers.
    ///
    /// No tombstone is left: a record that later shows up again at the same
    /// version is taken back.
    pub fn retain<F>(&mut self, keep: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let doomed: Vec<String> = self
            .records
            .keys()
            .filter(|id| !keep(id.as_str()))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return doomed;
        }
        let records = Arc::make_mut(&mut self.records);
        for id in &doomed {
            records.remove(id);
        }
        doomed
    }

    /// Drop tombstones older than the retention window.
    pub fn prune_tombstones(&mut self, now: Instant) -> usize {
        self.pruned_at = Some(now);
        let before = self.tombstones.len();
        let retention = self.retention;
        self.tombstones
            .retain(|_, t| now.saturating_duration_since(t.at) < retention);
        before - self.tombstones.len()
    }

    fn prune_if_due(&mut self, now: Instant) {
        let due = self
            .pruned_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.retention / 2);
        if due {
            self.prune_tombstones(now);
        }
    }

    fn live_tombstone(&mut self, id: &str, now: Instant) -> Option<Tombstone> {
        let tombstone = *self.tombstones.get(id)?;
        if now.saturating_duration_since(tombstone.at) >= self.retention {
            self.tombstones.remove(id);
            return None;
        }
        Some(tombstone)
    }

    fn bury(&mut self, id: &str, version: u64, now: Instant) {
        let entry = self.tombstones.entry(id.to_string()).or_insert(Tombstone {
            version,
            at: now,
        });
        if version > entry.version {
            *entry = Tombstone { version, at: now };
        }
    }
}
