//! Durable storage for the session credential.
//!
//! A single key (`SESSION_STORAGE_KEY`) holds the serialized `Credential`.
//! It is read on startup, written on login and cleared on logout.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StorageError;

use super::Credential;

/// Fixed namespace key for the persisted credential.
pub const SESSION_STORAGE_KEY: &str = "traceguard.session";

/// Storage capability injected into the session layer.
///
/// Implementations are synchronous: local storage reads/writes are small
/// and never worth a suspension point.
pub trait CredentialStorage: Send + Sync {
    fn load(&self) -> Result<Option<Credential>, StorageError>;
    fn save(&self, credential: &Credential) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// JSON file under a state directory: `<dir>/traceguard.session.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStorage {
    path: PathBuf,
}

impl FileCredentialStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{SESSION_STORAGE_KEY}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStorage for FileCredentialStorage {
    fn load(&self) -> Result<Option<Credential>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(credential)?;
        // Write-then-rename so a crash never leaves a torn file behind.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local storage. Keeps the serialized form so the codec path is
/// the same as the file store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    slot: Mutex<Option<String>>,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a raw stored value (tests use this to simulate corruption).
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(raw.into())),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>, StorageError> {
        self.slot.lock().map_err(|_| StorageError::Unavailable {
            message: "memory storage lock poisoned".to_string(),
        })
    }
}

impl CredentialStorage for MemoryCredentialStorage {
    fn load(&self) -> Result<Option<Credential>, StorageError> {
        match self.lock()?.as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), StorageError> {
        let raw = serde_json::to_string(credential)?;
        *self.lock()? = Some(raw);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.lock()? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn credential() -> Credential {
        Credential {
            token: "tok-123".to_string(),
            expires_at: Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()),
            subject: "alice".to_string(),
        }
    }

    #[test]
    fn test_file_storage_lifecycle() {
        let dir = tempdir().unwrap();
        let storage = FileCredentialStorage::new(dir.path());
        assert!(storage.load().unwrap().is_none());

        storage.save(&credential()).unwrap();
        assert!(storage.path().ends_with("traceguard.session.json"));
        assert_eq!(storage.load().unwrap(), Some(credential()));

        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_none());
        // Clearing an absent key is fine.
        storage.clear().unwrap();
    }

    #[test]
    fn test_file_storage_creates_missing_dir() {
        let dir = tempdir().unwrap();
        let storage = FileCredentialStorage::new(dir.path().join("nested/state"));
        storage.save(&credential()).unwrap();
        assert!(storage.load().unwrap().is_some());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let storage = FileCredentialStorage::new(dir.path());
        fs::write(storage.path(), b"not json").unwrap();
        assert!(matches!(storage.load(), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryCredentialStorage::new();
        storage.save(&credential()).unwrap();
        assert!(storage.raw().unwrap().contains("alice"));
        assert_eq!(storage.load().unwrap(), Some(credential()));
        storage.clear().unwrap();
        assert!(storage.raw().is_none());
    }
}
