//! Entity records and stream update events.
//!
//! Records are keyed by `id` within their entity type and ordered by their
//! version. SBOMs carry a numeric `version` counter; provenance records may
//! carry one and otherwise order by `createdAt`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Entity types kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sbom,
    Provenance,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Sbom, EntityKind::Provenance];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Sbom => "sbom",
            EntityKind::Provenance => "provenance",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that can live in a synced collection.
pub trait Entity:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Ordering key within one identifier.
    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);
}

/// Software bill of materials record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sbom {
    #[serde(rename = "identifier")]
    pub id: String,
    pub name: String,
    /// Document format, e.g. `cyclonedx-json` or `spdx`.
    pub format: String,
    /// Monotonic per-identifier counter assigned by the backend.
    pub version: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Entity for Sbom {
    const KIND: EntityKind = EntityKind::Sbom;

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Build provenance for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceRecord {
    #[serde(rename = "identifier")]
    pub id: String,
    #[serde(rename = "artifactIdentifier")]
    pub artifact_id: String,
    pub slsa_level: u8,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Explicit ordering counter. Absent on the wire for most records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Entity for ProvenanceRecord {
    const KIND: EntityKind = EntityKind::Provenance;

    fn id(&self) -> &str {
        &self.id
    }

    /// `version` when present, else `createdAt` in epoch milliseconds.
    fn version(&self) -> u64 {
        self.version
            .unwrap_or_else(|| u64::try_from(self.created_at.timestamp_millis()).unwrap_or(0))
    }

    fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }
}

/// One page of a paginated list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "E: Entity")]
pub struct Page<E: Entity> {
    pub records: Vec<E>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Created,
    Updated,
    Deleted,
}

/// Push update as delivered by the update stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub entity_type: EntityKind,
    pub kind: UpdateKind,
    #[serde(rename = "identifier")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub version: u64,
}

/// Typed change decoded from an `UpdateEvent`.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange<E> {
    Upsert(E),
    Delete { id: String, version: u64 },
}

impl UpdateEvent {
    /// Build a `Created`/`Updated` event from a record.
    pub fn upsert<E: Entity>(kind: UpdateKind, record: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entity_type: E::KIND,
            kind,
            id: record.id().to_string(),
            payload: Some(serde_json::to_value(record)?),
            version: record.version(),
        })
    }

    pub fn deleted(entity_type: EntityKind, id: impl Into<String>, version: u64) -> Self {
        Self {
            entity_type,
            kind: UpdateKind::Deleted,
            id: id.into(),
            payload: None,
            version,
        }
    }

    /// Decode into a typed change for `E`. The event's `version` is the
    /// authoritative ordering key and overrides any version in the payload.
    pub fn into_change<E: Entity>(self) -> Result<EntityChange<E>, CallError> {
        if self.entity_type != E::KIND {
            return Err(CallError::validation(format!(
                "event for {} decoded as {}",
                self.entity_type,
                E::KIND
            )));
        }
        match self.kind {
            UpdateKind::Deleted => Ok(EntityChange::Delete {
                id: self.id,
                version: self.version,
            }),
            UpdateKind::Created | UpdateKind::Updated => {
                let payload = self.payload.ok_or_else(|| {
                    CallError::validation(format!(
                        "{:?} event for '{}' has no payload",
                        self.kind, self.id
                    ))
                })?;
                let mut record: E = serde_json::from_value(payload).map_err(|e| {
                    CallError::validation(format!("undecodable {} payload: {e}", E::KIND))
                })?;
                if record.id() != self.id {
                    return Err(CallError::validation(format!(
                        "payload identifier '{}' does not match event identifier '{}'",
                        record.id(),
                        self.id
                    )));
                }
                record.set_version(self.version);
                Ok(EntityChange::Upsert(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sbom(id: &str, version: u64) -> Sbom {
        Sbom {
            id: id.to_string(),
            name: "web".to_string(),
            format: "cyclonedx-json".to_string(),
            version,
            content: "{}".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sbom_wire_field_names() {
        let value = serde_json::to_value(sbom("a", 3)).unwrap();
        assert_eq!(value["identifier"], "a");
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["version"], 3);
    }

    #[test]
    fn test_sbom_orders_by_numeric_version() {
        let record: Sbom = serde_json::from_value(json!({
            "identifier": "a",
            "name": "web",
            "format": "spdx",
            "version": 1,
            "content": "{}",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.version(), 1);
    }

    #[test]
    fn test_sbom_without_version_is_rejected() {
        let result = serde_json::from_value::<Sbom>(json!({
            "identifier": "a",
            "name": "web",
            "format": "spdx",
            "content": "{}",
            "createdAt": "2024-05-01T10:00:00Z"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_provenance_orders_by_created_at_without_version() {
        let record: ProvenanceRecord = serde_json::from_value(json!({
            "identifier": "p1",
            "artifactIdentifier": "ghcr.io/acme/web@sha256:abc",
            "slsaLevel": 3,
            "metadata": {"builder": "github-actions"},
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.version, None);
        assert_eq!(record.version(), 1_714_557_600_000);
        assert_eq!(record.metadata["builder"], "github-actions");

        let later: ProvenanceRecord = serde_json::from_value(json!({
            "identifier": "p1",
            "artifactIdentifier": "ghcr.io/acme/web@sha256:abc",
            "slsaLevel": 3,
            "createdAt": "2024-05-01T10:00:01Z"
        }))
        .unwrap();
        assert!(later.version() > record.version());
    }

    #[test]
    fn test_provenance_explicit_version_wins() {
        let record: ProvenanceRecord = serde_json::from_value(json!({
            "identifier": "p1",
            "artifactIdentifier": "ghcr.io/acme/web@sha256:abc",
            "slsaLevel": 2,
            "createdAt": "2024-05-01T10:00:00Z",
            "version": 7
        }))
        .unwrap();
        assert_eq!(record.version(), 7);
    }

    #[test]
    fn test_update_event_wire_shape() {
        let event: UpdateEvent = serde_json::from_value(json!({
            "entityType": "sbom",
            "kind": "Deleted",
            "identifier": "a",
            "version": 4
        }))
        .unwrap();
        assert_eq!(event, UpdateEvent::deleted(EntityKind::Sbom, "a", 4));
    }

    #[test]
    fn test_into_change_uses_event_version() {
        let mut event = UpdateEvent::upsert(UpdateKind::Updated, &sbom("a", 1)).unwrap();
        event.version = 9;
        match event.into_change::<Sbom>().unwrap() {
            EntityChange::Upsert(record) => assert_eq!(record.version, 9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_into_change_rejects_wrong_kind_and_missing_payload() {
        let event = UpdateEvent::upsert(UpdateKind::Created, &sbom("a", 1)).unwrap();
        assert!(event.clone().into_change::<ProvenanceRecord>().is_err());

        let mut missing = event;
        missing.payload = None;
        let err = missing.into_change::<Sbom>().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_into_change_rejects_mismatched_identifier() {
        let mut event = UpdateEvent::upsert(UpdateKind::Created, &sbom("a", 1)).unwrap();
        event.id = "b".to_string();
        assert!(event.into_change::<Sbom>().is_err());
    }
}
