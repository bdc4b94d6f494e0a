#![cfg(feature = "net")]

//! JSON-RPC 2.0 client for an external ledger process.
//!
//! Speaks three business methods over HTTP POST — `rx_anchor`, `rx_verify`,
//! `rx_dispense` — plus `rx_receipt`, a read used internally to resolve
//! ambiguous writes. Business rejections arrive as structured error codes
//! (the `-330xx` range below); the client never inspects human-readable
//! revert prose. Transport failures are retried per [`RetryPolicy`]; a write
//! whose submission outcome is unknown (timeout after the request left the
//! socket) is reconciled through `rx_receipt` before any resubmission so the
//! ledger never sees a double write.
//!
//! All connection parameters are explicit in [`RpcLedgerConfig`]; nothing is
//! read from globals at module load.

use crate::fingerprint::Fingerprint;
use crate::ledger::{
    AnchorReceipt, DispenseReceipt, LedgerClient, LedgerError, RetryPolicy, VerifyOutcome,
    VerifyReason,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Application error code: id already anchored.
pub const CODE_DUPLICATE_ID: i64 = -33001;
/// Application error code: no entry for id.
pub const CODE_NOT_FOUND: i64 = -33002;
/// Application error code: fingerprint mismatch on a guarded write.
pub const CODE_HASH_MISMATCH: i64 = -33003;
/// Application error code: entry expired.
pub const CODE_EXPIRED: i64 = -33004;
/// Application error code: entry already dispensed.
pub const CODE_ALREADY_DISPENSED: i64 = -33005;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection settings for [`RpcLedger`].
#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    /// HTTP endpoint of the ledger's JSON-RPC listener.
    pub endpoint: String,
    /// Per-request timeout; recommended range is 10–30s.
    pub request_timeout: Duration,
    /// Retry schedule for transient transport failures.
    pub retry: RetryPolicy,
}

impl RpcLedgerConfig {
    /// Builds a config with default timeout and retry settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// [`LedgerClient`] backed by a remote JSON-RPC ledger.
pub struct RpcLedger {
    cfg: RpcLedgerConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptView {
    anchor_tx: Option<String>,
    anchored_at: Option<u64>,
    dispense_tx: Option<String>,
    dispensed_at: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AnchorResult {
    tx_ref: String,
    anchored_at: u64,
}

#[derive(Debug, Deserialize)]
struct DispenseResult {
    tx_ref: String,
    dispensed_at: u64,
}

/// How a single call attempt failed.
enum CallFailure {
    /// The request never reached the ledger (connect/DNS refusal).
    NotSubmitted(String),
    /// The request may have reached the ledger; outcome unknown.
    Ambiguous(String),
    /// The ledger answered with a structured error.
    Rpc(RpcErrorBody),
}

fn reason_for_code(code: i64) -> Option<VerifyReason> {
    match code {
        CODE_NOT_FOUND => Some(VerifyReason::NotFound),
        CODE_HASH_MISMATCH => Some(VerifyReason::HashMismatch),
        CODE_EXPIRED => Some(VerifyReason::Expired),
        CODE_ALREADY_DISPENSED => Some(VerifyReason::AlreadyDispensed),
        _ => None,
    }
}

fn map_rpc_error(body: RpcErrorBody) -> LedgerError {
    if body.code == CODE_DUPLICATE_ID {
        // The id travels in the message for operators; the code is what the
        // caller branches on.
        return LedgerError::DuplicateId(body.message);
    }
    match reason_for_code(body.code) {
        Some(reason) => LedgerError::Rejected(reason),
        None => LedgerError::Protocol(format!("rpc error {}: {}", body.code, body.message)),
    }
}

impl RpcLedger {
    /// Creates a client for the configured endpoint.
    pub fn new(cfg: RpcLedgerConfig) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|err| LedgerError::Protocol(format!("http client: {err}")))?;
        Ok(Self {
            cfg,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, CallFailure> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .http
            .post(&self.cfg.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    CallFailure::NotSubmitted(err.to_string())
                } else {
                    CallFailure::Ambiguous(err.to_string())
                }
            })?;
        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|err| CallFailure::Ambiguous(format!("decode response: {err}")))?;
        if let Some(error) = parsed.error {
            return Err(CallFailure::Rpc(error));
        }
        parsed
            .result
            .ok_or_else(|| CallFailure::Rpc(RpcErrorBody {
                code: 0,
                message: "response carried neither result nor error".to_string(),
            }))
    }

    /// Read-only reconciliation call used after an ambiguous write.
    ///
    /// An unknown id arrives as a structured `CODE_NOT_FOUND` error and is
    /// folded into `Ok(None)` here, so callers can distinguish "the write
    /// never landed" from a transport failure of the reconciliation itself.
    async fn receipt(&self, id: &str) -> Result<Option<ReceiptView>, CallFailure> {
        match self
            .call::<ReceiptView>("rx_receipt", json!({ "id": id }))
            .await
        {
            Ok(view) => Ok(Some(view)),
            Err(CallFailure::Rpc(body)) if body.code == CODE_NOT_FOUND => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.cfg.retry.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn anchor(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
        expires_at: u64,
    ) -> Result<AnchorReceipt, LedgerError> {
        let params = json!({
            "id": id,
            "fingerprint": fingerprint.as_str(),
            "expires_at": expires_at,
        });
        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < self.cfg.retry.max_attempts {
            attempts += 1;
            self.backoff(attempts).await;
            match self.call::<AnchorResult>("rx_anchor", params.clone()).await {
                Ok(result) => {
                    return Ok(AnchorReceipt {
                        id: id.to_string(),
                        tx_ref: result.tx_ref,
                        anchored_at: result.anchored_at,
                    })
                }
                Err(CallFailure::Rpc(body)) => return Err(map_rpc_error(body)),
                Err(CallFailure::NotSubmitted(err)) => last_error = err,
                Err(CallFailure::Ambiguous(err)) => {
                    last_error = err;
                    // The write may have landed. Look before resubmitting.
                    match self.receipt(id).await {
                        Ok(Some(view)) => {
                            if let (Some(tx), Some(at)) = (view.anchor_tx, view.anchored_at) {
                                return Ok(AnchorReceipt {
                                    id: id.to_string(),
                                    tx_ref: tx,
                                    anchored_at: at,
                                });
                            }
                        }
                        Ok(None) => {} // definitely not landed; safe to retry
                        Err(CallFailure::Rpc(body)) => return Err(map_rpc_error(body)),
                        Err(_) => {} // reconciliation also unreachable; retry loop decides
                    }
                }
            }
        }
        Err(LedgerError::Unreachable {
            attempts,
            last_error,
        })
    }

    async fn verify(
        &self,
        id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<VerifyOutcome, LedgerError> {
        let params = json!({ "id": id, "fingerprint": fingerprint.as_str() });
        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < self.cfg.retry.max_attempts {
            attempts += 1;
            self.backoff(attempts).await;
            match self.call::<VerifyOutcome>("rx_verify", params.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(CallFailure::Rpc(body)) => return Err(map_rpc_error(body)),
                // Reads are side-effect free; every transport failure retries.
                Err(CallFailure::NotSubmitted(err)) | Err(CallFailure::Ambiguous(err)) => {
                    last_error = err
                }
            }
        }
        Err(LedgerError::Unreachable {
            attempts,
            last_error,
        })
    }

    async fn mark_dispensed(&self, id: &str, note: &str) -> Result<DispenseReceipt, LedgerError> {
        let params = json!({ "id": id, "note": note });
        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < self.cfg.retry.max_attempts {
            attempts += 1;
            self.backoff(attempts).await;
            match self.call::<DispenseResult>("rx_dispense", params.clone()).await {
                Ok(result) => {
                    return Ok(DispenseReceipt {
                        id: id.to_string(),
                        tx_ref: result.tx_ref,
                        dispensed_at: result.dispensed_at,
                    })
                }
                Err(CallFailure::Rpc(body)) => return Err(map_rpc_error(body)),
                Err(CallFailure::NotSubmitted(err)) => last_error = err,
                Err(CallFailure::Ambiguous(err)) => {
                    last_error = err;
                    match self.receipt(id).await {
                        Ok(Some(view)) => {
                            if let (Some(tx), Some(at)) = (view.dispense_tx, view.dispensed_at) {
                                return Ok(DispenseReceipt {
                                    id: id.to_string(),
                                    tx_ref: tx,
                                    dispensed_at: at,
                                });
                            }
                        }
                        Ok(None) => {
                            return Err(LedgerError::Rejected(VerifyReason::NotFound));
                        }
                        Err(CallFailure::Rpc(body)) => return Err(map_rpc_error(body)),
                        Err(_) => {}
                    }
                }
            }
        }
        Err(LedgerError::Unreachable {
            attempts,
            last_error,
        })
    }
}
