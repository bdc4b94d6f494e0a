#![deny(missing_docs)]

//! # rx_anchor
//!
//! **rx_anchor** is the integrity core for anchored prescriptions: it decides
//! whether a prescription presented at dispensation time is the same one a
//! clinician issued, and it enforces that each prescription is dispensed at
//! most once.  Authenticity is established by content, not by storage — a
//! deterministic fingerprint of the clinical payload is anchored on a ledger
//! at issuance, and every dispense attempt recomputes the fingerprint from
//! the data actually presented and asks the ledger for a verdict.
//!
//! ## Features
//!
//! * **Content fingerprints**: the [`fingerprint`](fingerprint/index.html)
//!   module produces a domain-separated SHA-256 digest over a canonical
//!   encoding of the clinical payload and the subject/issuer identities.
//!   Transport metadata (id, issuance time, expiry) is excluded, so renewing
//!   an expiry never changes what the fingerprint attests to.
//! * **Ledger client seam**: the [`ledger`](ledger/index.html) module defines
//!   the [`LedgerClient`] trait with `anchor`, `verify` and `mark_dispensed`
//!   operations, structured [`VerifyReason`] verdicts, and a retry policy
//!   that distinguishes transient transport failures from business
//!   rejections.  [`MemoryLedger`](ledger::memory::MemoryLedger) is a full
//!   in-process implementation; the `net` feature adds a JSON-RPC client
//!   that reconciles ambiguous writes through a receipt read instead of
//!   blind resubmission.
//! * **Lifecycle controller**: [`PrescriptionService`] drives the
//!   `Draft -> Anchored -> Dispensed` state machine.  Nothing is persisted
//!   locally before the ledger acknowledges the anchor, and a lost dispense
//!   race surfaces as an ordinary already-dispensed outcome because the
//!   at-most-once transition lives in the ledger, not in process memory.
//! * **Tamper-evident history**: the [`history`](history/index.html) module
//!   keeps an append-only, hash-chained record of every successful
//!   dispensation, verified on reopen so an edited file is rejected at
//!   startup.
//!
//! ## Usage
//!
//! Fingerprinting is pure and needs no runtime:
//!
//! ```rust
//! use rx_anchor::{fingerprint, ClinicalPayload, LineItem};
//!
//! let payload = ClinicalPayload {
//!     diagnosis: "seasonal influenza".to_string(),
//!     items: vec![LineItem {
//!         drug_id: "paracetamol".to_string(),
//!         name: "Paracetamol".to_string(),
//!         strength: "500mg".to_string(),
//!         volume: String::new(),
//!         quantity: "10".to_string(),
//!         frequency: "1-0-1".to_string(),
//!         instructions: "after meals".to_string(),
//!     }],
//! };
//!
//! let a = fingerprint("patient-1", "doctor-1", &payload);
//! let b = fingerprint("patient-1", "doctor-1", &payload);
//! assert_eq!(a, b);
//! assert_eq!(a.as_str().len(), 64);
//! ```
//!
//! The lifecycle API is async; wire a [`PrescriptionService`] to a ledger
//! client and drive it from any executor.

pub mod audit;
pub mod clock;
pub mod fingerprint;
pub mod history;
pub mod ledger;
pub mod payload;
pub mod service;
pub mod store;

pub use audit::AuditLog;
pub use clock::{now_secs, system_clock, Clock};
pub use fingerprint::{canonical_encoding, fingerprint, Fingerprint};
pub use history::{DispenseEvent, DispenseHistoryRecord, HistoryError, HistoryStore};
pub use ledger::memory::MemoryLedger;
pub use ledger::{
    AnchorReceipt, DispenseReceipt, LedgerClient, LedgerError, RetryPolicy, VerifyOutcome,
    VerifyReason,
};
pub use payload::{ClinicalPayload, LineItem, ValidationError};
pub use service::{
    Draft, DispenseError, IssueError, PrescriptionService, ServiceConfig, SetupError,
};
pub use store::{PrescriptionRecord, RecordStore, StoreError};

#[cfg(feature = "net")]
pub use ledger::rpc::{RpcLedger, RpcLedgerConfig};
