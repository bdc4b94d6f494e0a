//! Clinical payload model and issue-time validation.
//!
//! The payload is the portion of a prescription that carries clinical
//! meaning: the diagnosis text and the ordered list of medicine line items.
//! Everything in it participates in the fingerprint; transport metadata
//! (record id, timestamps, expiry) deliberately does not.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single medicine entry within a prescription payload.
///
/// `drug_id`, `quantity` and `frequency` are mandatory at issuance; the
/// remaining fields may be empty but still contribute to the fingerprint so
/// that a post-issuance edit to any of them is detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Stable identifier of the prescribed drug.
    pub drug_id: String,
    /// Human-readable drug name.
    #[serde(default)]
    pub name: String,
    /// Dose strength, e.g. `500mg`.
    #[serde(default)]
    pub strength: String,
    /// Volume for liquid preparations, e.g. `100ml`.
    #[serde(default)]
    pub volume: String,
    /// Quantity to dispense.
    pub quantity: String,
    /// Intake frequency, e.g. `1-0-1`.
    pub frequency: String,
    /// Free-text intake instructions.
    #[serde(default)]
    pub instructions: String,
}

/// Ordered clinical content of a prescription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalPayload {
    /// Diagnosis / clinical notes recorded by the issuer.
    pub diagnosis: String,
    /// Ordered medicine line items. Order is significant and fingerprinted.
    pub items: Vec<LineItem>,
}

/// Reasons an issuance request is rejected before any ledger contact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The payload contained no line items.
    #[error("payload contains no line items")]
    EmptyPayload,
    /// The diagnosis text was blank.
    #[error("diagnosis must not be blank")]
    BlankDiagnosis,
    /// A mandatory field of a line item was blank.
    #[error("line item {index} is missing required field `{field}`")]
    MissingItemField {
        /// Zero-based position of the offending item.
        index: usize,
        /// Name of the blank mandatory field.
        field: &'static str,
    },
    /// An identity string (issuer or subject) was blank.
    #[error("{role} identity must not be blank")]
    BlankIdentity {
        /// Which identity was blank (`issuer` or `subject`).
        role: &'static str,
    },
    /// The requested expiry was not in the future.
    #[error("expiry {expires_at} is not after issuance time {now}")]
    ExpiryNotInFuture {
        /// Requested expiry, epoch seconds.
        expires_at: u64,
        /// Issuance clock reading, epoch seconds.
        now: u64,
    },
}

impl ClinicalPayload {
    /// Checks structural completeness: at least one item, a diagnosis, and
    /// the mandatory fields of every item present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.diagnosis.trim().is_empty() {
            return Err(ValidationError::BlankDiagnosis);
        }
        if self.items.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        for (index, item) in self.items.iter().enumerate() {
            for (field, value) in [
                ("drug_id", &item.drug_id),
                ("quantity", &item.quantity),
                ("frequency", &item.frequency),
            ] {
                if value.trim().is_empty() {
                    return Err(ValidationError::MissingItemField { index, field });
                }
            }
        }
        Ok(())
    }
}

/// Validates the identities and expiry accompanying an issuance request.
pub fn validate_issue_request(
    issuer_id: &str,
    subject_id: &str,
    expires_at: u64,
    now: u64,
) -> Result<(), ValidationError> {
    if issuer_id.trim().is_empty() {
        return Err(ValidationError::BlankIdentity { role: "issuer" });
    }
    if subject_id.trim().is_empty() {
        return Err(ValidationError::BlankIdentity { role: "subject" });
    }
    if expires_at <= now {
        return Err(ValidationError::ExpiryNotInFuture { expires_at, now });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> LineItem {
        LineItem {
            drug_id: "paracetamol".to_string(),
            name: "Paracetamol".to_string(),
            strength: "500mg".to_string(),
            volume: String::new(),
            quantity: "10".to_string(),
            frequency: "1-0-1".to_string(),
            instructions: "after meals".to_string(),
        }
    }

    #[test]
    fn accepts_complete_payload() {
        let payload = ClinicalPayload {
            diagnosis: "flu".to_string(),
            items: vec![sample_item()],
        };
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn rejects_empty_item_list() {
        let payload = ClinicalPayload {
            diagnosis: "flu".to_string(),
            items: Vec::new(),
        };
        assert_eq!(payload.validate(), Err(ValidationError::EmptyPayload));
    }

    #[test]
    fn rejects_blank_mandatory_field() {
        let mut item = sample_item();
        item.frequency = "   ".to_string();
        let payload = ClinicalPayload {
            diagnosis: "flu".to_string(),
            items: vec![item],
        };
        assert_eq!(
            payload.validate(),
            Err(ValidationError::MissingItemField {
                index: 0,
                field: "frequency"
            })
        );
    }

    #[test]
    fn rejects_blank_diagnosis() {
        let payload = ClinicalPayload {
            diagnosis: String::new(),
            items: vec![sample_item()],
        };
        assert_eq!(payload.validate(), Err(ValidationError::BlankDiagnosis));
    }

    #[test]
    fn rejects_expiry_in_the_past() {
        let err = validate_issue_request("d1", "p1", 100, 200).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ExpiryNotInFuture {
                expires_at: 100,
                now: 200
            }
        );
    }

    #[test]
    fn rejects_blank_identities() {
        assert_eq!(
            validate_issue_request("", "p1", 200, 100),
            Err(ValidationError::BlankIdentity { role: "issuer" })
        );
        assert_eq!(
            validate_issue_request("d1", " ", 200, 100),
            Err(ValidationError::BlankIdentity { role: "subject" })
        );
    }
}
