//! Local mirror of anchored prescription records.
//!
//! The mirror serves `lookup` without a ledger round trip. It is exactly
//! that — a mirror: the authoritative integrity state always lives in the
//! ledger, and the mirror is only written after the ledger has acknowledged
//! the corresponding anchor. Persistence is a single JSON document written
//! through a temp-file rename so a crash never leaves a half-written store.

use crate::payload::ClinicalPayload;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// A prescription as mirrored locally after anchoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescriptionRecord {
    /// Unique id assigned at issuance.
    pub id: String,
    /// Identity of the issuing authority.
    pub issuer_id: String,
    /// Identity of the record's subject.
    pub subject_id: String,
    /// Issuance time, epoch seconds. Immutable.
    pub issued_at: u64,
    /// Validity deadline, epoch seconds.
    pub expires_at: u64,
    /// Clinical content. Immutable once anchored.
    pub payload: ClinicalPayload,
    /// Ledger transaction reference of the anchoring write.
    pub anchor_tx: String,
    /// Whether a dispense has been mirrored for this record.
    pub dispensed: bool,
    /// Mirrored dispensation time, epoch seconds.
    pub dispensed_at: Option<u64>,
}

/// Failures while loading or flushing the mirror.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error: {0}")]
    Io(String),
    /// JSON encode/decode failure.
    #[error("store codec error: {0}")]
    Codec(String),
}

/// Mutex-guarded record map with optional JSON persistence.
pub struct RecordStore {
    records: Mutex<HashMap<String, PrescriptionRecord>>,
    path: Option<PathBuf>,
}

impl RecordStore {
    /// Creates an empty, purely in-memory store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Opens a store backed by a JSON file; missing file means empty state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let bytes = fs::read(&path).map_err(|err| StoreError::Io(err.to_string()))?;
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Codec(err.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            records: Mutex::new(records),
            path: Some(path),
        })
    }

    /// Returns a copy of the record for `id`, if mirrored.
    pub fn get(&self, id: &str) -> Option<PrescriptionRecord> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .get(id)
            .cloned()
    }

    /// Number of mirrored records.
    pub fn len(&self) -> usize {
        self.records.lock().expect("store lock poisoned").len()
    }

    /// True when nothing has been mirrored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts (or replaces) a record and flushes to disk if configured.
    pub fn put(&self, record: PrescriptionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        records.insert(record.id.clone(), record);
        self.flush(&records)
    }

    /// Marks the mirrored record dispensed. Missing ids are ignored: the
    /// ledger, not the mirror, is the authority on dispensation.
    pub fn mark_dispensed(&self, id: &str, dispensed_at: u64) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        if let Some(record) = records.get_mut(id) {
            record.dispensed = true;
            record.dispensed_at = Some(dispensed_at);
        }
        self.flush(&records)
    }

    fn flush(&self, records: &HashMap<String, PrescriptionRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))?;
        }
        let bytes =
            serde_json::to_vec_pretty(records).map_err(|err| StoreError::Codec(err.to_string()))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, bytes).map_err(|err| StoreError::Io(err.to_string()))?;
        fs::rename(&tmp, path).map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(())
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::LineItem;

    fn sample_record(id: &str) -> PrescriptionRecord {
        PrescriptionRecord {
            id: id.to_string(),
            issuer_id: "d1".to_string(),
            subject_id: "p1".to_string(),
            issued_at: 100,
            expires_at: 10_000,
            payload: ClinicalPayload {
                diagnosis: "flu".to_string(),
                items: vec![LineItem {
                    drug_id: "paracetamol".to_string(),
                    name: String::new(),
                    strength: String::new(),
                    volume: String::new(),
                    quantity: "10".to_string(),
                    frequency: "1-0-1".to_string(),
                    instructions: String::new(),
                }],
            },
            anchor_tx: "aa".repeat(32),
            dispensed: false,
            dispensed_at: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = RecordStore::new();
        store.put(sample_record("rx-1")).unwrap();
        let got = store.get("rx-1").unwrap();
        assert_eq!(got.payload.diagnosis, "flu");
        assert!(store.get("rx-2").is_none());
    }

    #[test]
    fn mark_dispensed_updates_only_existing() {
        let store = RecordStore::new();
        store.put(sample_record("rx-1")).unwrap();
        store.mark_dispensed("rx-1", 555).unwrap();
        store.mark_dispensed("rx-ghost", 555).unwrap();
        let got = store.get("rx-1").unwrap();
        assert!(got.dispensed);
        assert_eq!(got.dispensed_at, Some(555));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "rx_anchor_store_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let path = dir.join("records.json");
        {
            let store = RecordStore::open(&path).unwrap();
            store.put(sample_record("rx-1")).unwrap();
        }
        let reopened = RecordStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("rx-1").unwrap().issuer_id, "d1");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
