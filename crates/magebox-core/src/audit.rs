//! Tamper-evident audit hash chain.
//!
//! Every entry stores the SHA-256 of its own content plus the hash of the
//! entry before it. Editing any persisted field breaks the chain from that
//! entry onwards, which [`verify_audit_chain`] reports by index.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single persisted audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Row ID assigned by the store. Part of the hashed content.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Acting user name, or `admin` for the static admin token.
    pub user: String,
    /// Machine-readable action tag, e.g. `user.create`.
    pub action: String,
    pub details: String,
    pub ip: String,
    pub hash: String,
    pub prev_hash: String,
}

/// Outcome of walking the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries: usize,
    /// Index (in the supplied slice) of the first entry that does not verify.
    pub first_invalid_index: Option<usize>,
}

/// Hash an entry's content together with its predecessor's hash.
///
/// The pre-image is `id|timestamp|user|action|details|ip|prev_hash` with the
/// timestamp rendered as RFC 3339 UTC at second precision. The entry's own
/// `hash` and `prev_hash` fields are ignored in favour of `prev_hash`.
#[must_use]
pub fn compute_audit_hash(entry: &AuditEntry, prev_hash: &str) -> String {
    let preimage = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        entry.id,
        entry.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        entry.user,
        entry.action,
        entry.details,
        entry.ip,
        prev_hash,
    );
    hex::encode(Sha256::digest(preimage.as_bytes()))
}

/// Verify a complete, chronologically ordered history: the first entry
/// must have an empty `prev_hash`.
#[must_use]
pub fn verify_audit_chain(entries: &[AuditEntry]) -> ChainVerification {
    verify_audit_chain_from(entries, "")
}

/// Verify a chronologically ordered slice whose first entry must link to
/// `anchor`: the hash of the last entry removed by a retention purge, or
/// empty when nothing was ever removed.
///
/// Every later entry must link to the stored hash of the entry before it and
/// its stored hash must match the recomputed one.
#[must_use]
pub fn verify_audit_chain_from(entries: &[AuditEntry], anchor: &str) -> ChainVerification {
    let mut expected_prev = anchor.to_owned();

    for (index, entry) in entries.iter().enumerate() {
        let recomputed = compute_audit_hash(entry, &expected_prev);
        if entry.prev_hash != expected_prev || entry.hash != recomputed {
            return ChainVerification {
                valid: false,
                entries: entries.len(),
                first_invalid_index: Some(index),
            };
        }
        expected_prev.clone_from(&entry.hash);
    }

    ChainVerification {
        valid: true,
        entries: entries.len(),
        first_invalid_index: None,
    }
}
