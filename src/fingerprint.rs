//! Deterministic content fingerprints for prescription payloads.
//!
//! A fingerprint is a domain-separated SHA-256 digest over a canonical,
//! newline-delimited ASCII encoding of the clinical payload together with
//! the subject and issuer identities. The encoding fixes both the record
//! order and the field order inside every record, so two logically identical
//! payloads hash identically no matter how the caller's input was keyed.
//!
//! Transport metadata — record id, issuance time, expiry — is excluded on
//! purpose: extending an expiry must not change the fingerprint.

use crate::payload::ClinicalPayload;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const FINGERPRINT_DOMAIN: &[u8] = b"RXA_FINGERPRINT_V1\n";

/// Hex-encoded SHA-256 digest of a canonical payload encoding.
///
/// Always 64 lowercase hex characters. Ordering and equality are derived so
/// fingerprints can key maps and be compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Returns the hex digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an externally transported digest string after shape-checking it.
    ///
    /// Accepts exactly 64 lowercase hex characters. Use this only for values
    /// read back from the ledger or storage; fingerprints of untrusted
    /// payloads must always be recomputed via [`fingerprint`].
    pub fn parse(input: &str) -> Result<Self, String> {
        if input.len() != 64 {
            return Err(format!("expected 64 hex characters, found {}", input.len()));
        }
        if !input
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err("digest contains non-hex characters".to_string());
        }
        Ok(Self(input.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escapes a field value so that record and field delimiters cannot collide.
///
/// `%`, `|`, and newline are percent-encoded; everything else passes through
/// byte-for-byte.
pub(crate) fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    out
}

/// Emits the canonical newline-delimited encoding that gets hashed.
///
/// The format is stable: one `subject:` line, one `issuer:` line, one
/// `diagnosis:` line, then one `item:` line per line item carrying its
/// fields in declared order, pipe-separated. Item position is part of the
/// record, so reordering two items changes the encoding.
pub fn canonical_encoding(subject_id: &str, issuer_id: &str, payload: &ClinicalPayload) -> String {
    let mut lines = Vec::with_capacity(3 + payload.items.len());
    lines.push(format!("subject:{}", escape_field(subject_id)));
    lines.push(format!("issuer:{}", escape_field(issuer_id)));
    lines.push(format!("diagnosis:{}", escape_field(&payload.diagnosis)));
    for (index, item) in payload.items.iter().enumerate() {
        lines.push(format!(
            "item:{index}|drug={}|name={}|strength={}|volume={}|qty={}|freq={}|instr={}",
            escape_field(&item.drug_id),
            escape_field(&item.name),
            escape_field(&item.strength),
            escape_field(&item.volume),
            escape_field(&item.quantity),
            escape_field(&item.frequency),
            escape_field(&item.instructions),
        ));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Computes the fingerprint of a prescription's clinical content.
///
/// Pure and deterministic; performs no I/O.
pub fn fingerprint(subject_id: &str, issuer_id: &str, payload: &ClinicalPayload) -> Fingerprint {
    let encoding = canonical_encoding(subject_id, issuer_id, payload);
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update(encoding.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::LineItem;
    use proptest::prelude::*;

    fn sample_payload() -> ClinicalPayload {
        ClinicalPayload {
            diagnosis: "flu".to_string(),
            items: vec![LineItem {
                drug_id: "paracetamol".to_string(),
                name: "Paracetamol".to_string(),
                strength: "500mg".to_string(),
                volume: String::new(),
                quantity: "10".to_string(),
                frequency: "1-0-1".to_string(),
                instructions: "after meals".to_string(),
            }],
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let payload = sample_payload();
        let a = fingerprint("p1", "d1", &payload);
        let b = fingerprint("p1", "d1", &payload);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_ignores_json_key_order() {
        // The same line item keyed two different ways must parse into the
        // same struct and therefore the same fingerprint.
        let ordered: LineItem = serde_json::from_str(
            r#"{"drug_id":"x","quantity":"1","frequency":"1-1-1","name":"X"}"#,
        )
        .unwrap();
        let shuffled: LineItem = serde_json::from_str(
            r#"{"name":"X","frequency":"1-1-1","drug_id":"x","quantity":"1"}"#,
        )
        .unwrap();
        let pa = ClinicalPayload {
            diagnosis: "d".to_string(),
            items: vec![ordered],
        };
        let pb = ClinicalPayload {
            diagnosis: "d".to_string(),
            items: vec![shuffled],
        };
        assert_eq!(fingerprint("p", "d", &pa), fingerprint("p", "d", &pb));
    }

    #[test]
    fn single_character_change_alters_digest() {
        let payload = sample_payload();
        let base = fingerprint("p1", "d1", &payload);
        let mut tampered = payload.clone();
        tampered.items[0].quantity = "11".to_string();
        assert_ne!(base, fingerprint("p1", "d1", &tampered));
    }

    #[test]
    fn item_order_is_significant() {
        let mut two = sample_payload();
        two.items.push(LineItem {
            drug_id: "ibuprofen".to_string(),
            name: String::new(),
            strength: "200mg".to_string(),
            volume: String::new(),
            quantity: "6".to_string(),
            frequency: "0-1-0".to_string(),
            instructions: String::new(),
        });
        let forward = fingerprint("p1", "d1", &two);
        let mut reversed = two.clone();
        reversed.items.reverse();
        assert_ne!(forward, fingerprint("p1", "d1", &reversed));
    }

    #[test]
    fn identities_are_part_of_the_digest() {
        let payload = sample_payload();
        assert_ne!(
            fingerprint("p1", "d1", &payload),
            fingerprint("p2", "d1", &payload)
        );
        assert_ne!(
            fingerprint("p1", "d1", &payload),
            fingerprint("p1", "d2", &payload)
        );
    }

    #[test]
    fn delimiters_cannot_collide_across_fields() {
        // "a|b" in one field must not encode like "a" and "b" in neighbours.
        let mut a = sample_payload();
        a.items[0].strength = "a|b".to_string();
        a.items[0].volume = String::new();
        let mut b = sample_payload();
        b.items[0].strength = "a".to_string();
        b.items[0].volume = "b".to_string();
        assert_ne!(fingerprint("p", "d", &a), fingerprint("p", "d", &b));
    }

    #[test]
    fn parse_accepts_own_output_and_rejects_garbage() {
        let digest = fingerprint("p1", "d1", &sample_payload());
        assert_eq!(Fingerprint::parse(digest.as_str()).unwrap(), digest);
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"Z".repeat(64)).is_err());
    }

    proptest! {
        #[test]
        fn any_field_mutation_changes_fingerprint(
            diagnosis in "[a-z ]{1,20}",
            qty in "[0-9]{1,4}",
            extra in "[a-z0-9]{1,8}",
        ) {
            let payload = ClinicalPayload {
                diagnosis: diagnosis.clone(),
                items: vec![LineItem {
                    drug_id: "drug".to_string(),
                    name: String::new(),
                    strength: String::new(),
                    volume: String::new(),
                    quantity: qty.clone(),
                    frequency: "1-0-1".to_string(),
                    instructions: String::new(),
                }],
            };
            let base = fingerprint("p", "d", &payload);

            let mut mutated = payload.clone();
            mutated.items[0].quantity = format!("{qty}{extra}");
            prop_assert_ne!(base.clone(), fingerprint("p", "d", &mutated));

            let mut mutated = payload;
            mutated.diagnosis = format!("{diagnosis}{extra}");
            prop_assert_ne!(base, fingerprint("p", "d", &mutated));
        }

        #[test]
        fn fingerprint_repeatable_for_arbitrary_text(
            subject in "\\PC{0,16}",
            issuer in "\\PC{0,16}",
            notes in "\\PC{0,32}",
        ) {
            let payload = ClinicalPayload {
                diagnosis: notes,
                items: vec![LineItem {
                    drug_id: "d".to_string(),
                    name: String::new(),
                    strength: String::new(),
                    volume: String::new(),
                    quantity: "1".to_string(),
                    frequency: "1".to_string(),
                    instructions: String::new(),
                }],
            };
            prop_assert_eq!(
                fingerprint(&subject, &issuer, &payload),
                fingerprint(&subject, &issuer, &payload)
            );
        }
    }
}
