//! Append-only dispense history with hash chaining.
//!
//! Every successful dispensation appends exactly one record. Records are
//! never updated or deleted; each one carries the BLAKE2b-256 digest of its
//! own content combined with the digest of its predecessor, so any in-place
//! edit of the stored file breaks the chain at a pinpointable sequence
//! number. The chain is local evidence, independent of the ledger's own
//! transaction log.
//!
//! Persistence is JSON-lines: one record appended per dispensation, no
//! rewrites of earlier lines.

use crate::fingerprint::escape_field;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

const CHAIN_DOMAIN: &[u8] = b"RXA_HISTORY_V1";

/// One successful dispensation, as recorded for audit and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseHistoryRecord {
    /// Position in the chain, starting at 0.
    pub seq: u64,
    /// Id of the dispensed prescription.
    pub prescription_id: String,
    /// Dispensing pharmacist, or `None` for an anonymous dispensation.
    pub pharmacist_id: Option<String>,
    /// Dispensation time, epoch seconds.
    pub dispensed_at: u64,
    /// Note recorded with the dispense write.
    pub note: String,
    /// Ledger transaction reference returned by `mark_dispensed`.
    pub ledger_receipt: String,
    /// Hex digest of the preceding record (chain head digest for seq 0).
    pub prev_digest: String,
    /// Hex BLAKE2b-256 digest over this record's content and `prev_digest`.
    pub digest: String,
}

/// Failures while appending to or reading the history file.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Filesystem failure.
    #[error("history I/O error: {0}")]
    Io(String),
    /// JSON encode/decode failure.
    #[error("history codec error: {0}")]
    Codec(String),
    /// The persisted chain does not recompute; first bad sequence number.
    #[error("history chain broken at seq {0}")]
    ChainBroken(u64),
}

/// Content of a record before it is sealed into the chain.
#[derive(Debug, Clone)]
pub struct DispenseEvent {
    /// Id of the dispensed prescription.
    pub prescription_id: String,
    /// Dispensing pharmacist, if identified.
    pub pharmacist_id: Option<String>,
    /// Dispensation time, epoch seconds.
    pub dispensed_at: u64,
    /// Note recorded with the dispense write.
    pub note: String,
    /// Ledger transaction reference.
    pub ledger_receipt: String,
}

/// Append-only history store with an in-memory index.
pub struct HistoryStore {
    entries: Mutex<Vec<DispenseHistoryRecord>>,
    path: Option<PathBuf>,
}

fn chain_head() -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(CHAIN_DOMAIN);
    hasher.update([1u8]); // empty-chain marker
    hex::encode(hasher.finalize())
}

/// Canonical single-line encoding of the sealed fields.
fn canonical_line(seq: u64, event: &DispenseEvent) -> String {
    format!(
        "seq={seq}|rx={}|by={}|at={}|note={}|receipt={}",
        escape_field(&event.prescription_id),
        escape_field(event.pharmacist_id.as_deref().unwrap_or("")),
        event.dispensed_at,
        escape_field(&event.note),
        escape_field(&event.ledger_receipt),
    )
}

fn seal_digest(seq: u64, event: &DispenseEvent, prev_digest: &str) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(CHAIN_DOMAIN);
    hasher.update([0u8]); // record marker
    hasher.update(prev_digest.as_bytes());
    hasher.update(canonical_line(seq, event).as_bytes());
    hex::encode(hasher.finalize())
}

fn event_of(record: &DispenseHistoryRecord) -> DispenseEvent {
    DispenseEvent {
        prescription_id: record.prescription_id.clone(),
        pharmacist_id: record.pharmacist_id.clone(),
        dispensed_at: record.dispensed_at,
        note: record.note.clone(),
        ledger_receipt: record.ledger_receipt.clone(),
    }
}

impl HistoryStore {
    /// Creates an empty, purely in-memory history.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Opens a history backed by a JSON-lines file; missing file means empty.
    ///
    /// The loaded chain is verified before the store is handed out, so a
    /// tampered file is rejected at startup rather than silently extended.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let mut entries = Vec::new();
        if path.exists() {
            let contents =
                fs::read_to_string(&path).map_err(|err| HistoryError::Io(err.to_string()))?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: DispenseHistoryRecord =
                    serde_json::from_str(line).map_err(|err| HistoryError::Codec(err.to_string()))?;
                entries.push(record);
            }
        }
        let store = Self {
            entries: Mutex::new(entries),
            path: Some(path),
        };
        store.verify_chain()?;
        Ok(store)
    }

    /// Seals `event` into the chain and appends it. Returns the full record.
    pub fn append(&self, event: DispenseEvent) -> Result<DispenseHistoryRecord, HistoryError> {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        let seq = entries.len() as u64;
        let prev_digest = entries
            .last()
            .map(|r| r.digest.clone())
            .unwrap_or_else(chain_head);
        let digest = seal_digest(seq, &event, &prev_digest);
        let record = DispenseHistoryRecord {
            seq,
            prescription_id: event.prescription_id.clone(),
            pharmacist_id: event.pharmacist_id.clone(),
            dispensed_at: event.dispensed_at,
            note: event.note.clone(),
            ledger_receipt: event.ledger_receipt.clone(),
            prev_digest,
            digest,
        };
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| HistoryError::Io(err.to_string()))?;
            }
            let line = serde_json::to_string(&record)
                .map_err(|err| HistoryError::Codec(err.to_string()))?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| HistoryError::Io(err.to_string()))?;
            writeln!(file, "{line}").map_err(|err| HistoryError::Io(err.to_string()))?;
        }
        entries.push(record.clone());
        Ok(record)
    }

    /// Records dispensed by `pharmacist_id`, most recent first.
    ///
    /// `None` selects anonymous dispensations, mirroring the inbound query
    /// contract where an unauthenticated request still sees a useful list.
    pub fn for_pharmacist(&self, pharmacist_id: Option<&str>) -> Vec<DispenseHistoryRecord> {
        let entries = self.entries.lock().expect("history lock poisoned");
        let mut matched: Vec<_> = entries
            .iter()
            .filter(|r| r.pharmacist_id.as_deref() == pharmacist_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.dispensed_at.cmp(&a.dispensed_at).then(b.seq.cmp(&a.seq)));
        matched
    }

    /// All records for one prescription id (at most one when the ledger's
    /// at-most-once guarantee holds).
    pub fn for_prescription(&self, prescription_id: &str) -> Vec<DispenseHistoryRecord> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .iter()
            .filter(|r| r.prescription_id == prescription_id)
            .cloned()
            .collect()
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    /// True when no dispensation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recomputes the whole chain, reporting the first divergent record.
    pub fn verify_chain(&self) -> Result<(), HistoryError> {
        let entries = self.entries.lock().expect("history lock poisoned");
        let mut prev = chain_head();
        for (idx, record) in entries.iter().enumerate() {
            let seq = idx as u64;
            let expected = seal_digest(seq, &event_of(record), &prev);
            if record.seq != seq || record.prev_digest != prev || record.digest != expected {
                return Err(HistoryError::ChainBroken(seq));
            }
            prev = record.digest.clone();
        }
        Ok(())
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(rx: &str, by: Option<&str>, at: u64) -> DispenseEvent {
        DispenseEvent {
            prescription_id: rx.to_string(),
            pharmacist_id: by.map(str::to_string),
            dispensed_at: at,
            note: "ok".to_string(),
            ledger_receipt: "cc".repeat(32),
        }
    }

    #[test]
    fn chain_links_and_verifies() {
        let store = HistoryStore::new();
        let first = store.append(event("rx-1", Some("ph-1"), 100)).unwrap();
        let second = store.append(event("rx-2", Some("ph-1"), 200)).unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.prev_digest, first.digest);
        assert!(store.verify_chain().is_ok());
    }

    #[test]
    fn pharmacist_filter_and_ordering() {
        let store = HistoryStore::new();
        store.append(event("rx-1", Some("ph-1"), 100)).unwrap();
        store.append(event("rx-2", None, 150)).unwrap();
        store.append(event("rx-3", Some("ph-1"), 300)).unwrap();

        let mine = store.for_pharmacist(Some("ph-1"));
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].prescription_id, "rx-3");
        assert_eq!(mine[1].prescription_id, "rx-1");

        let anonymous = store.for_pharmacist(None);
        assert_eq!(anonymous.len(), 1);
        assert_eq!(anonymous[0].prescription_id, "rx-2");
    }

    #[test]
    fn tampered_note_breaks_chain_at_that_seq() {
        let store = HistoryStore::new();
        store.append(event("rx-1", None, 100)).unwrap();
        store.append(event("rx-2", None, 200)).unwrap();
        {
            let mut entries = store.entries.lock().unwrap();
            entries[1].note = "edited".to_string();
        }
        match store.verify_chain() {
            Err(HistoryError::ChainBroken(seq)) => assert_eq!(seq, 1),
            other => panic!("expected broken chain, got {other:?}"),
        }
    }

    #[test]
    fn reopen_replays_and_rejects_tampering() {
        let dir = std::env::temp_dir().join(format!(
            "rx_anchor_history_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let path = dir.join("history.jsonl");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.append(event("rx-1", Some("ph-1"), 100)).unwrap();
            store.append(event("rx-2", Some("ph-2"), 200)).unwrap();
        }
        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);

        // Flip a byte in the stored file; reopening must fail.
        let tampered = fs::read_to_string(&path).unwrap().replace("rx-2", "rx-9");
        fs::write(&path, tampered).unwrap();
        assert!(matches!(
            HistoryStore::open(&path),
            Err(HistoryError::ChainBroken(1))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
