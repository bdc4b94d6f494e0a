//! Prescription lifecycle controller.
//!
//! Orchestrates the `Draft -> Anchored -> Dispensed` state machine over an
//! injected [`LedgerClient`]: issuance fingerprints the payload and anchors
//! it, lookups read the local mirror, and dispensation re-fingerprints the
//! payload *as presented by the caller* and lets the ledger decide whether
//! it matches the anchored record. The controller holds no per-id locks;
//! at-most-once dispensation is the ledger's atomic transition, and a lost
//! race surfaces as an ordinary already-dispensed outcome.
//!
//! `Expired` is never a stored state — it is computed at verify time from
//! the ledger's clock.

use crate::audit::AuditLog;
use crate::clock::{system_clock, Clock};
use crate::fingerprint::fingerprint;
use crate::history::{DispenseEvent, DispenseHistoryRecord, HistoryError, HistoryStore};
use crate::ledger::{LedgerClient, LedgerError, VerifyReason};
use crate::payload::{validate_issue_request, ClinicalPayload, ValidationError};
use crate::store::{PrescriptionRecord, RecordStore, StoreError};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// An issuance request before it has an id or a ledger anchor.
#[derive(Debug, Clone)]
pub struct Draft {
    /// Identity of the issuing authority.
    pub issuer_id: String,
    /// Identity of the record's subject.
    pub subject_id: String,
    /// Validity deadline, epoch seconds.
    pub expires_at: u64,
    /// Clinical content to freeze at anchoring.
    pub payload: ClinicalPayload,
}

/// Storage and audit locations for a [`PrescriptionService`].
///
/// All paths are optional; a default config yields a fully in-memory
/// service, which is what tests use.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// JSON file for the prescription mirror.
    pub record_path: Option<PathBuf>,
    /// JSON-lines file for the dispense history chain.
    pub history_path: Option<PathBuf>,
    /// Directory for the audit event log.
    pub audit_dir: Option<PathBuf>,
}

/// Failures while opening the service's local state.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The prescription mirror could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The dispense history could not be loaded or failed chain verification.
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Failures of the `issue` operation.
#[derive(Debug, Error)]
pub enum IssueError {
    /// The request was rejected before any ledger contact.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// The ledger refused or could not be reached; nothing was persisted.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Failures of the `dispense` operation.
///
/// The first four variants are business outcomes the caller is expected to
/// present verbatim; they are deliberately distinct so a tamper signal is
/// never blurred into a generic failure.
#[derive(Debug, Error)]
pub enum DispenseError {
    /// No record is known for the id.
    #[error("prescription not found")]
    NotFound,
    /// Presented data does not match the authentic anchored record.
    #[error("prescription data does not match the authentic record")]
    HashMismatch,
    /// The prescription's validity deadline has passed.
    #[error("prescription has expired")]
    Expired,
    /// The prescription was already dispensed; no further action is needed.
    #[error("prescription has already been dispensed")]
    AlreadyDispensed,
    /// Infrastructure failure talking to the ledger.
    #[error(transparent)]
    Ledger(LedgerError),
    /// The ledger accepted the dispense but the history append failed.
    #[error("dispense history append failed: {0}")]
    History(#[from] HistoryError),
}

fn rejection(reason: VerifyReason) -> DispenseError {
    match reason {
        VerifyReason::NotFound => DispenseError::NotFound,
        VerifyReason::HashMismatch => DispenseError::HashMismatch,
        VerifyReason::Expired => DispenseError::Expired,
        VerifyReason::AlreadyDispensed => DispenseError::AlreadyDispensed,
        VerifyReason::Ok => {
            DispenseError::Ledger(LedgerError::Protocol("rejection carried reason OK".to_string()))
        }
    }
}

/// Lifecycle controller over an injected ledger client.
pub struct PrescriptionService {
    ledger: Arc<dyn LedgerClient>,
    store: RecordStore,
    history: HistoryStore,
    audit: AuditLog,
    clock: Clock,
}

impl PrescriptionService {
    /// Opens the service's local state and wires it to `ledger`.
    pub fn new(ledger: Arc<dyn LedgerClient>, config: ServiceConfig) -> Result<Self, SetupError> {
        let store = match &config.record_path {
            Some(path) => RecordStore::open(path)?,
            None => RecordStore::new(),
        };
        let history = match &config.history_path {
            Some(path) => HistoryStore::open(path)?,
            None => HistoryStore::new(),
        };
        let audit = match &config.audit_dir {
            Some(dir) => AuditLog::with_dir(dir),
            None => AuditLog::stdout(),
        };
        Ok(Self {
            ledger,
            store,
            history,
            audit,
            clock: system_clock(),
        })
    }

    /// Replaces the clock source. Tests pin this to a shared counter.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Issues a prescription: validate, fingerprint, anchor, mirror.
    ///
    /// Nothing is persisted locally unless the ledger acknowledged the
    /// anchor, so a failed or cancelled issuance leaves no ghost record. If
    /// the mirror flush fails *after* the acknowledgement, the in-memory
    /// record remains authoritative, the incident is audited, and
    /// [`resync`](Self::resync) can rebuild the on-disk mirror later.
    pub async fn issue(&self, draft: Draft) -> Result<PrescriptionRecord, IssueError> {
        let now = (self.clock)();
        validate_issue_request(&draft.issuer_id, &draft.subject_id, draft.expires_at, now)?;
        draft.payload.validate()?;

        let digest = fingerprint(&draft.subject_id, &draft.issuer_id, &draft.payload);
        let id = generate_id(now);
        let receipt = self.ledger.anchor(&id, &digest, draft.expires_at).await?;

        let record = PrescriptionRecord {
            id: id.clone(),
            issuer_id: draft.issuer_id,
            subject_id: draft.subject_id,
            issued_at: now,
            expires_at: draft.expires_at,
            payload: draft.payload,
            anchor_tx: receipt.tx_ref.clone(),
            dispensed: false,
            dispensed_at: None,
        };
        if let Err(err) = self.store.put(record.clone()) {
            self.audit.event(
                "ISSUE",
                "MIRROR_FLUSH_FAILED",
                &[("id", &id), ("error", &err.to_string())],
            );
        }
        self.audit.event(
            "ISSUE",
            "ANCHORED",
            &[("id", &id), ("tx", &receipt.tx_ref)],
        );
        Ok(record)
    }

    /// Read-only lookup against the local mirror.
    ///
    /// Policy choice: lookups never contact the ledger. The trust boundary
    /// for authenticity is `dispense`, which always re-verifies; lookups
    /// stay cheap and available even while the ledger is down.
    pub fn lookup(&self, id: &str) -> Option<PrescriptionRecord> {
        self.store.get(id)
    }

    /// Dispenses a prescription against the payload the caller presents.
    ///
    /// The fingerprint is recomputed from `current_payload`, not from the
    /// mirrored copy — divergence between what is presented and what was
    /// anchored is precisely what this call exists to catch. Exactly one
    /// history record is appended per successful dispensation.
    pub async fn dispense(
        &self,
        id: &str,
        current_payload: &ClinicalPayload,
        pharmacist_id: Option<&str>,
        note: &str,
    ) -> Result<DispenseHistoryRecord, DispenseError> {
        let record = self.store.get(id).ok_or(DispenseError::NotFound)?;
        let digest = fingerprint(&record.subject_id, &record.issuer_id, current_payload);

        let outcome = self
            .ledger
            .verify(id, &digest)
            .await
            .map_err(DispenseError::Ledger)?;
        if !outcome.valid {
            self.audit_rejection(id, pharmacist_id, outcome.reason);
            return Err(rejection(outcome.reason));
        }

        let receipt = match self.ledger.mark_dispensed(id, note).await {
            Ok(receipt) => receipt,
            // A racing dispense that committed first arrives here; the loser
            // gets a clean rejection, not a crash.
            Err(LedgerError::Rejected(reason)) => {
                self.audit_rejection(id, pharmacist_id, reason);
                return Err(rejection(reason));
            }
            Err(err) => return Err(DispenseError::Ledger(err)),
        };

        let history_record = match self.history.append(DispenseEvent {
            prescription_id: id.to_string(),
            pharmacist_id: pharmacist_id.map(str::to_string),
            dispensed_at: receipt.dispensed_at,
            note: note.to_string(),
            ledger_receipt: receipt.tx_ref.clone(),
        }) {
            Ok(record) => record,
            Err(err) => {
                // The ledger transition is already committed; losing the
                // local audit row is an incident, not a rollback.
                self.audit.event(
                    "DISPENSE",
                    "HISTORY_APPEND_FAILED",
                    &[("id", id), ("error", &err.to_string())],
                );
                return Err(DispenseError::History(err));
            }
        };

        if let Err(err) = self.store.mark_dispensed(id, receipt.dispensed_at) {
            self.audit.event(
                "DISPENSE",
                "MIRROR_FLUSH_FAILED",
                &[("id", id), ("error", &err.to_string())],
            );
        }
        self.audit.event(
            "DISPENSE",
            "OK",
            &[
                ("id", id),
                ("by", pharmacist_id.unwrap_or("anonymous")),
                ("tx", &receipt.tx_ref),
            ],
        );
        Ok(history_record)
    }

    /// Dispense history filtered by pharmacist, most recent first.
    ///
    /// `None` returns anonymous dispensations.
    pub fn dispense_history(&self, pharmacist_id: Option<&str>) -> Vec<DispenseHistoryRecord> {
        self.history.for_pharmacist(pharmacist_id)
    }

    /// Recomputes the local history hash chain.
    pub fn verify_history(&self) -> Result<(), HistoryError> {
        self.history.verify_chain()
    }

    /// Rebuilds a lost mirror entry from caller-supplied data.
    ///
    /// Used after a mirror flush failure or a crash between ledger
    /// acknowledgement and local persistence. The record (typically
    /// reconstructed from the original issue response) is accepted only if
    /// the ledger confirms its recomputed fingerprint; anything else is
    /// rejected with the ledger's verdict.
    pub async fn resync(
        &self,
        record: PrescriptionRecord,
    ) -> Result<PrescriptionRecord, DispenseError> {
        let digest = fingerprint(&record.subject_id, &record.issuer_id, &record.payload);
        let outcome = self
            .ledger
            .verify(&record.id, &digest)
            .await
            .map_err(DispenseError::Ledger)?;
        if !outcome.valid {
            return Err(rejection(outcome.reason));
        }
        if let Err(err) = self.store.put(record.clone()) {
            self.audit.event(
                "RESYNC",
                "MIRROR_FLUSH_FAILED",
                &[("id", &record.id), ("error", &err.to_string())],
            );
        }
        self.audit.event("RESYNC", "OK", &[("id", &record.id)]);
        Ok(record)
    }

    fn audit_rejection(&self, id: &str, pharmacist_id: Option<&str>, reason: VerifyReason) {
        // Hash mismatches and double-dispense attempts are tamper/fraud
        // signals and always leave an audit trace; the remaining reasons are
        // routine and only worth a line for operator context.
        let event = match reason {
            VerifyReason::HashMismatch => "HASH_MISMATCH",
            VerifyReason::AlreadyDispensed => "ALREADY_DISPENSED",
            VerifyReason::Expired => "EXPIRED",
            VerifyReason::NotFound => "NOT_FOUND",
            VerifyReason::Ok => return,
        };
        self.audit.event(
            "DISPENSE",
            event,
            &[("id", id), ("by", pharmacist_id.unwrap_or("anonymous"))],
        );
    }
}

fn generate_id(now: u64) -> String {
    let mut nonce = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut nonce);
    format!("rx-{now}-{}", hex::encode(nonce))
}
