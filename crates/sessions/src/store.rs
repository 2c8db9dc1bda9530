//! Durable session metadata.
//!
//! A flat JSON array of `{id, webhook_url, status}` records in
//! `<data_dir>/sessions.json`, rewritten in full on every save. This is
//! observability/listing state only — loading it back does **not** make
//! sessions live again; restoration is lazy (see the readiness gate).
//! Each session additionally owns `<data_dir>/<id>/`, an opaque
//! credential directory managed by the adapter.

use std::path::{Path, PathBuf};

use cb_domain::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::machine::SessionStatus;

/// One persisted session record. Credentials are deliberately excluded —
/// they live in the adapter's credential directory, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub webhook_url: Option<String>,
    pub status: SessionStatus,
}

/// Metadata store rooted at the bridge data directory.
pub struct MetadataStore {
    data_dir: PathBuf,
    file_path: PathBuf,
}

impl MetadataStore {
    /// Open (and create, if needed) the store under `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(Error::Io)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            file_path: data_dir.join("sessions.json"),
        })
    }

    /// Load the persisted records. A missing or unparsable file is not
    /// fatal — the bridge starts with an empty set.
    pub fn load(&self) -> Vec<SessionRecord> {
        let raw = match std::fs::read_to_string(&self.file_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.file_path.display(), error = %e, "metadata read failed");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<SessionRecord>>(&raw) {
            Ok(records) => {
                tracing::info!(
                    sessions = records.len(),
                    path = %self.file_path.display(),
                    "session metadata loaded"
                );
                records
            }
            Err(e) => {
                tracing::warn!(path = %self.file_path.display(), error = %e, "metadata parse failed");
                Vec::new()
            }
        }
    }

    /// Overwrite the full metadata snapshot.
    pub fn save(&self, records: &[SessionRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.file_path, json).map_err(Error::Io)?;
        Ok(())
    }

    /// Exclusive credential directory for a session id.
    pub fn credential_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(session_id)
    }

    /// Recursively remove a session's credential directory. Absent is fine.
    pub fn remove_credentials(&self, session_id: &str) -> Result<()> {
        let dir = self.credential_dir(session_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Whether a session has persisted credentials on disk.
    pub fn has_credentials(&self, session_id: &str) -> bool {
        self.credential_dir(session_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            webhook_url: Some(format!("https://hooks.test/{id}")),
            status,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();

        let records = vec![
            rec("s1", SessionStatus::Ready),
            rec("s2", SessionStatus::WaitingForScan),
        ];
        store.save(&records).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, records);
    }

    #[test]
    fn load_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("sessions.json"), "{not json").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn file_is_a_flat_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();
        store.save(&[rec("s1", SessionStatus::Ready)]).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("sessions.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[0]["status"], "READY");
        assert_eq!(parsed[0]["id"], "s1");
    }

    #[test]
    fn credential_dir_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();

        let cred = store.credential_dir("s1");
        std::fs::create_dir_all(cred.join("Default")).unwrap();
        std::fs::write(cred.join("Default/cookies"), b"blob").unwrap();
        assert!(store.has_credentials("s1"));

        store.remove_credentials("s1").unwrap();
        assert!(!store.has_credentials("s1"));

        // Removing again is a no-op.
        store.remove_credentials("s1").unwrap();
    }
}
