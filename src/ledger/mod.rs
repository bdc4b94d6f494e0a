//! Narrow contract to the append-only, tamper-evident prescription ledger.
//!
//! The lifecycle controller never talks to a concrete ledger directly; it
//! holds a [`LedgerClient`] trait object. Production deployments point it at
//! the JSON-RPC client in [`rpc`] (feature `net`); tests and single-node
//! deployments use the in-process [`MemoryLedger`](memory::MemoryLedger).
//!
//! The contract is deliberately small — `anchor`, `verify`,
//! `mark_dispensed` — and business-logic mismatches travel as ordinary
//! [`VerifyOutcome`] values, never as transport errors. Only genuine
//! infrastructure failures surface as [`LedgerError::Unreachable`].

/// In-process ledger with atomic dispense transitions.
pub mod memory;
/// JSON-RPC ledger client over HTTP.
#[cfg(feature = "net")]
pub mod rpc;

use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Receipt returned by a successful `anchor` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    /// Prescription id the anchor commits to.
    pub id: String,
    /// Ledger-side transaction reference for the anchoring write.
    pub tx_ref: String,
    /// Ledger clock reading at anchoring, epoch seconds.
    pub anchored_at: u64,
}

/// Receipt returned by a successful `mark_dispensed` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseReceipt {
    /// Prescription id that was dispensed.
    pub id: String,
    /// Ledger-side transaction reference for the dispense write.
    pub tx_ref: String,
    /// Ledger clock reading at dispensation, epoch seconds.
    pub dispensed_at: u64,
}

/// Verification verdict categories.
///
/// `Ok` is the only valid verdict; the others explain why dispensation must
/// not proceed. The wire encoding is SCREAMING_SNAKE so RPC ledgers and this
/// crate agree on a structured code instead of prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyReason {
    /// The presented fingerprint matches the anchored one and all guards pass.
    Ok,
    /// No ledger entry exists for the id.
    NotFound,
    /// The presented fingerprint differs from the anchored one.
    HashMismatch,
    /// The entry's expiry has passed.
    Expired,
    /// The entry has already been dispensed.
    AlreadyDispensed,
}

impl fmt::Display for VerifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::Expired => "EXPIRED",
            Self::AlreadyDispensed => "ALREADY_DISPENSED",
        };
        f.write_str(label)
    }
}

/// Outcome of a `verify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    /// Whether dispensation may proceed.
    pub valid: bool,
    /// Structured verdict explaining the decision.
    pub reason: VerifyReason,
}

impl VerifyOutcome {
    /// Verdict permitting dispensation.
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: VerifyReason::Ok,
        }
    }

    /// Verdict rejecting dispensation for the given reason.
    pub fn invalid(reason: VerifyReason) -> Self {
        debug_assert!(reason != VerifyReason::Ok);
        Self {
            valid: false,
            reason,
        }
    }
}

/// Failures surfaced by ledger client implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The ledger could not be contacted after the retry policy was exhausted.
    #[error("ledger unreachable after {attempts} attempt(s): {last_error}")]
    Unreachable {
        /// Number of transport attempts made.
        attempts: u32,
        /// Description of the final transport failure.
        last_error: String,
    },
    /// An anchor was attempted for an id that is already anchored.
    #[error("id `{0}` is already anchored")]
    DuplicateId(String),
    /// The ledger's own guards rejected a dispense write.
    #[error("ledger rejected the write: {0}")]
    Rejected(VerifyReason),
    /// The ledger answered, but the response violated the wire contract.
    #[error("ledger protocol violation: {0}")]
    Protocol(String),
}

impl LedgerError {
    /// True for failures worth retrying at a coarser level (transport only).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Bounded retry schedule for transient transport failures.
///
/// Business rejections (`DuplicateId`, `Rejected`) are never retried; the
/// policy only governs connect/timeout style failures. Delays grow
/// exponentially from `base_delay` up to `max_delay` with up to 25% random
/// jitter to avoid thundering retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Jittered delay before `attempt` (1-based; attempt 1 has no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(16);
        let base = self.base_delay.as_millis() as u64;
        let raw = base.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay.as_millis() as u64).max(1);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }
}

/// Client contract for the external append-only ledger.
///
/// Implementations own connection and retry concerns. A write whose outcome
/// is ambiguous (e.g. timeout after submission) must not be blindly
/// resubmitted; the implementation first consults `verify` to learn whether
/// the write landed.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Commits `fingerprint` and `expires_at` for `id` into the ledger.
    async fn anchor(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
        expires_at: u64,
    ) -> Result<AnchorReceipt, LedgerError>;

    /// Checks the presented fingerprint against the anchored entry.
    ///
    /// Mismatches are expected outcomes reported through
    /// [`VerifyOutcome::valid`], never through `Err`.
    async fn verify(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<VerifyOutcome, LedgerError>;

    /// Atomically transitions the entry for `id` to dispensed.
    ///
    /// The ledger itself enforces the already-dispensed, expired and
    /// hash-mismatch guards so a compromised caller cannot bypass them;
    /// rejections surface as [`LedgerError::Rejected`].
    async fn mark_dispensed(&self, id: &str, note: &str) -> Result<DispenseReceipt, LedgerError>;
}
