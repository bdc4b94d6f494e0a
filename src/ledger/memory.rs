//! In-process ledger implementation with atomic dispense transitions.
//!
//! Deployments without an external ledger process still get the contract's
//! guarantees: the entry table lives behind a single mutex, so
//! `mark_dispensed` is an atomic compare-and-set on the `dispensed` flag and
//! concurrent dispense attempts for one id produce exactly one winner.
//! State can optionally be persisted as JSON so a restart does not forget
//! anchored entries; a missing file loads as an empty ledger.

use crate::clock::{system_clock, Clock};
use crate::fingerprint::Fingerprint;
use crate::ledger::{
    AnchorReceipt, DispenseReceipt, LedgerClient, LedgerError, VerifyOutcome, VerifyReason,
};
use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TX_DOMAIN: &[u8] = b"RXA_TX_V1";

/// One anchored prescription as the ledger sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSlot {
    /// Fingerprint committed at anchoring time.
    pub fingerprint: Fingerprint,
    /// Validity deadline, epoch seconds.
    pub expires_at: u64,
    /// Terminal dispensation flag; never cleared once set.
    pub dispensed: bool,
    /// Note supplied with the dispense write.
    pub dispense_note: Option<String>,
    /// Transaction reference of the anchoring write.
    pub anchor_tx: String,
    /// Transaction reference of the dispense write, if any.
    pub dispense_tx: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    seq: u64,
    entries: HashMap<String, LedgerSlot>,
}

/// Mutex-guarded ledger table with optional JSON persistence.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
    clock: Clock,
}

impl MemoryLedger {
    /// Creates an empty, purely in-memory ledger.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            path: None,
            clock: system_clock(),
        }
    }

    /// Opens a ledger backed by a JSON file; missing file means empty state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|err| LedgerError::Protocol(format!("read ledger state: {err}")))?;
            serde_json::from_slice(&bytes)
                .map_err(|err| LedgerError::Protocol(format!("decode ledger state: {err}")))?
        } else {
            LedgerState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            clock: system_clock(),
        })
    }

    /// Replaces the clock source. Tests pin this to a shared counter.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Number of anchored entries.
    pub fn len(&self) -> usize {
        self.state.lock().expect("ledger lock poisoned").entries.len()
    }

    /// True when no entry has been anchored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only copy of a slot, mainly for diagnostics and tests.
    pub fn slot(&self, id: &str) -> Option<LedgerSlot> {
        self.state
            .lock()
            .expect("ledger lock poisoned")
            .entries
            .get(id)
            .cloned()
    }

    fn persist(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| LedgerError::Protocol(format!("create ledger dir: {err}")))?;
        }
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|err| LedgerError::Protocol(format!("encode ledger state: {err}")))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, bytes)
            .map_err(|err| LedgerError::Protocol(format!("write ledger state: {err}")))?;
        fs::rename(&tmp, path)
            .map_err(|err| LedgerError::Protocol(format!("commit ledger state: {err}")))?;
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn tx_ref(kind: &str, id: &str, seq: u64) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(TX_DOMAIN);
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(id.as_bytes());
    hasher.update(seq.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn anchor(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
        expires_at: u64,
    ) -> Result<AnchorReceipt, LedgerError> {
        let now = (self.clock)();
        let mut state = self.state.lock().expect("ledger lock poisoned");
        if state.entries.contains_key(id) {
            return Err(LedgerError::DuplicateId(id.to_string()));
        }
        state.seq += 1;
        let tx = tx_ref("anchor", id, state.seq);
        state.entries.insert(
            id.to_string(),
            LedgerSlot {
                fingerprint: fingerprint.clone(),
                expires_at,
                dispensed: false,
                dispense_note: None,
                anchor_tx: tx.clone(),
                dispense_tx: None,
            },
        );
        self.persist(&state)?;
        Ok(AnchorReceipt {
            id: id.to_string(),
            tx_ref: tx,
            anchored_at: now,
        })
    }

    async fn verify(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<VerifyOutcome, LedgerError> {
        let now = (self.clock)();
        let state = self.state.lock().expect("ledger lock poisoned");
        let Some(slot) = state.entries.get(id) else {
            return Ok(VerifyOutcome::invalid(VerifyReason::NotFound));
        };
        // Guard order at verify time: expiry dominates the dispensed flag so
        // a stale record reads as expired, not merely used up.
        if now > slot.expires_at {
            return Ok(VerifyOutcome::invalid(VerifyReason::Expired));
        }
        if slot.dispensed {
            return Ok(VerifyOutcome::invalid(VerifyReason::AlreadyDispensed));
        }
        if slot.fingerprint != *fingerprint {
            return Ok(VerifyOutcome::invalid(VerifyReason::HashMismatch));
        }
        Ok(VerifyOutcome::ok())
    }

    async fn mark_dispensed(&self, id: &str, note: &str) -> Result<DispenseReceipt, LedgerError> {
        let now = (self.clock)();
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.seq += 1;
        let seq = state.seq;
        let Some(slot) = state.entries.get_mut(id) else {
            return Err(LedgerError::Rejected(VerifyReason::NotFound));
        };
        // Terminal state dominates for writes.
        if slot.dispensed {
            return Err(LedgerError::Rejected(VerifyReason::AlreadyDispensed));
        }
        if now > slot.expires_at {
            return Err(LedgerError::Rejected(VerifyReason::Expired));
        }
        let tx = tx_ref("dispense", id, seq);
        slot.dispensed = true;
        slot.dispense_note = Some(note.to_string());
        slot.dispense_tx = Some(tx.clone());
        self.persist(&state)?;
        Ok(DispenseReceipt {
            id: id.to_string(),
            tx_ref: tx,
            dispensed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{fingerprint, Fingerprint};
    use crate::payload::{ClinicalPayload, LineItem};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn sample_fingerprint(tag: &str) -> Fingerprint {
        let payload = ClinicalPayload {
            diagnosis: tag.to_string(),
            items: vec![LineItem {
                drug_id: "paracetamol".to_string(),
                name: String::new(),
                strength: String::new(),
                volume: String::new(),
                quantity: "10".to_string(),
                frequency: "1-0-1".to_string(),
                instructions: String::new(),
            }],
        };
        fingerprint("p1", "d1", &payload)
    }

    fn fixed_clock(start: u64) -> (Arc<AtomicU64>, Clock) {
        let shared = Arc::new(AtomicU64::new(start));
        let reader = Arc::clone(&shared);
        (shared, Box::new(move || reader.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn anchor_then_verify_ok() {
        let ledger = MemoryLedger::new();
        let fp = sample_fingerprint("flu");
        let receipt = ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap();
        assert_eq!(receipt.id, "rx-1");
        assert_eq!(receipt.tx_ref.len(), 64);
        let outcome = ledger.verify("rx-1", &fp).await.unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.reason, VerifyReason::Ok);
    }

    #[tokio::test]
    async fn duplicate_anchor_is_a_conflict() {
        let ledger = MemoryLedger::new();
        let fp = sample_fingerprint("flu");
        ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap();
        let err = ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap_err();
        assert_eq!(err, LedgerError::DuplicateId("rx-1".to_string()));
    }

    #[tokio::test]
    async fn verify_reports_structured_reasons() {
        let ledger = MemoryLedger::new();
        let fp = sample_fingerprint("flu");
        let other = sample_fingerprint("cold");

        let missing = ledger.verify("rx-none", &fp).await.unwrap();
        assert_eq!(missing.reason, VerifyReason::NotFound);

        ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap();
        let mismatch = ledger.verify("rx-1", &other).await.unwrap();
        assert!(!mismatch.valid);
        assert_eq!(mismatch.reason, VerifyReason::HashMismatch);

        ledger.mark_dispensed("rx-1", "done").await.unwrap();
        let used = ledger.verify("rx-1", &fp).await.unwrap();
        assert_eq!(used.reason, VerifyReason::AlreadyDispensed);
    }

    #[tokio::test]
    async fn expiry_boundary_is_exact() {
        let (shared, clock) = fixed_clock(1_000);
        let ledger = MemoryLedger::new().with_clock(clock);
        let fp = sample_fingerprint("flu");
        ledger.anchor("rx-1", &fp, 2_000).await.unwrap();

        shared.store(1_999, Ordering::SeqCst);
        assert!(ledger.verify("rx-1", &fp).await.unwrap().valid);

        shared.store(2_000, Ordering::SeqCst);
        assert!(ledger.verify("rx-1", &fp).await.unwrap().valid);

        shared.store(2_001, Ordering::SeqCst);
        let outcome = ledger.verify("rx-1", &fp).await.unwrap();
        assert_eq!(outcome.reason, VerifyReason::Expired);

        let err = ledger.mark_dispensed("rx-1", "late").await.unwrap_err();
        assert_eq!(err, LedgerError::Rejected(VerifyReason::Expired));
    }

    #[tokio::test]
    async fn second_dispense_is_rejected_idempotently() {
        let ledger = MemoryLedger::new();
        let fp = sample_fingerprint("flu");
        ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap();
        ledger.mark_dispensed("rx-1", "first").await.unwrap();
        let err = ledger.mark_dispensed("rx-1", "second").await.unwrap_err();
        assert_eq!(err, LedgerError::Rejected(VerifyReason::AlreadyDispensed));
        // The winning note is untouched by the losing attempt.
        assert_eq!(ledger.slot("rx-1").unwrap().dispense_note.as_deref(), Some("first"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispense_has_single_winner() {
        let ledger = Arc::new(MemoryLedger::new());
        let fp = sample_fingerprint("flu");
        ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.mark_dispensed("rx-1", &format!("att-{n}")).await
            }));
        }
        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(LedgerError::Rejected(VerifyReason::AlreadyDispensed)) => losses += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(losses, 7);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "rx_anchor_ledger_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let path = dir.join("ledger.json");
        let fp = sample_fingerprint("flu");
        {
            let ledger = MemoryLedger::open(&path).unwrap();
            ledger.anchor("rx-1", &fp, u64::MAX).await.unwrap();
        }
        let reopened = MemoryLedger::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.verify("rx-1", &fp).await.unwrap().valid);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
