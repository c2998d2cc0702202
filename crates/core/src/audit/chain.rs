use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{AuditError, AuditEvent};

type HmacSha256 = Hmac<Sha256>;

/// An audit event sealed into a hash chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedAuditRecord {
    pub sequence: u64,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub signature: String,
    pub event: AuditEvent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Links each sealed record to its predecessor and signs the link, so edits,
/// deletions and reordering of a persisted trail are detectable.
#[derive(Clone)]
pub struct AuditChain {
    signing_key: Vec<u8>,
    next_sequence: u64,
    last_hash: Option<String>,
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("signing_key", &"<redacted>")
            .field("next_sequence", &self.next_sequence)
            .field("last_hash", &self.last_hash)
            .finish()
    }
}

impl AuditChain {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self { signing_key: signing_key.as_ref().to_vec(), next_sequence: 1, last_hash: None }
    }

    /// Continues an existing chain after `last`.
    pub fn resume(signing_key: impl AsRef<[u8]>, last: Option<&SealedAuditRecord>) -> Self {
        let mut chain = Self::new(signing_key);
        if let Some(last) = last {
            chain.next_sequence = last.sequence.saturating_add(1);
            chain.last_hash = Some(last.entry_hash.clone());
        }
        chain
    }

    pub fn seal(&mut self, event: AuditEvent) -> Result<SealedAuditRecord, AuditError> {
        let sequence = self.next_sequence;
        let prev_hash = self.last_hash.clone();
        let entry_hash = hash_entry_material(sequence, prev_hash.as_deref(), &event)?;
        let signature = hmac_hex(&self.signing_key, entry_hash.as_bytes());

        self.next_sequence = sequence.saturating_add(1);
        self.last_hash = Some(entry_hash.clone());

        Ok(SealedAuditRecord { sequence, prev_hash, entry_hash, signature, event })
    }
}

pub fn verify_chain(records: &[SealedAuditRecord], signing_key: &[u8]) -> ChainVerification {
    let mut previous_hash: Option<String> = None;
    let mut expected_sequence = records.first().map(|record| record.sequence).unwrap_or(1);

    for (index, record) in records.iter().enumerate() {
        let failure = |reason: String, latest: Option<String>| ChainVerification {
            valid: false,
            verified_entries: index,
            latest_hash: latest,
            failure_reason: Some(reason),
        };

        if record.sequence != expected_sequence {
            return failure(
                format!(
                    "sequence gap at event {}: expected {}, found {}",
                    record.event.event_id, expected_sequence, record.sequence
                ),
                previous_hash,
            );
        }

        if index > 0 && record.prev_hash != previous_hash {
            return failure(
                format!("previous hash mismatch at event {}", record.event.event_id),
                previous_hash,
            );
        }

        let computed = match hash_entry_material(
            record.sequence,
            record.prev_hash.as_deref(),
            &record.event,
        ) {
            Ok(hash) => hash,
            Err(error) => {
                return failure(
                    format!("event {} could not be canonicalized: {error}", record.event.event_id),
                    previous_hash,
                )
            }
        };
        if computed != record.entry_hash {
            return failure(
                format!("entry hash mismatch at event {}", record.event.event_id),
                previous_hash,
            );
        }

        if hmac_hex(signing_key, record.entry_hash.as_bytes()) != record.signature {
            return failure(
                format!("signature mismatch at event {}", record.event.event_id),
                previous_hash,
            );
        }

        previous_hash = Some(record.entry_hash.clone());
        expected_sequence = record.sequence.saturating_add(1);
    }

    ChainVerification {
        valid: true,
        verified_entries: records.len(),
        latest_hash: previous_hash,
        failure_reason: None,
    }
}

fn hash_entry_material(
    sequence: u64,
    prev_hash: Option<&str>,
    event: &AuditEvent,
) -> Result<String, AuditError> {
    let canonical_event = serde_json::to_string(event)?;
    let material = format!("{}|{}|{}", sequence, prev_hash.unwrap_or(""), canonical_event);
    Ok(sha256_hex(material.as_bytes()))
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
