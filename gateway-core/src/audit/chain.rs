//! Hash chain + detached signature for audit entries (spec.md §4: "on each
//! log call, increment seq, stamp prev = lastHash, compute
//! hash = SHA256(prev ‖ canonicalJSON(entry-sans-hash-sig)), produce a
//! detached signature (Ed25519 if a private key exists, otherwise
//! HMAC-SHA256 keyed by the genesis hash)").
//!
//! `AuditChain` holds the mutable chain tip; callers serialize access to it
//! through a single `tokio::sync::Mutex` (see [`super::logger::AuditLogger`])
//! so that `seq` assignment and the resulting append are never reordered.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::event::AuditEntry;
use crate::error::Error;

/// 64 hex zero characters — the chain's genesis `prev` value.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

type HmacSha256 = Hmac<Sha256>;

enum Signer {
    Ed25519(Box<SigningKey>),
    Hmac(Box<[u8]>),
}

/// Mutable chain state: the running `prev` hash, the next `seq`, and the
/// signer used to produce detached signatures.
pub struct AuditChain {
    prev_hash: String,
    seq: u64,
    signer: Signer,
    verifying_key: Option<VerifyingKey>,
}

impl AuditChain {
    /// Start a fresh chain at genesis.
    pub fn genesis(signing_key: Option<SigningKey>) -> Self {
        Self::resume(GENESIS_HASH.to_string(), 0, signing_key)
    }

    /// Resume a chain from a previously persisted head `{hash, seq}`.
    pub fn resume(prev_hash: String, seq: u64, signing_key: Option<SigningKey>) -> Self {
        let (signer, verifying_key) = match signing_key {
            Some(key) => {
                let vk = key.verifying_key();
                (Signer::Ed25519(Box::new(key)), Some(vk))
            }
            None => (
                Signer::Hmac(GENESIS_HASH.as_bytes().to_vec().into_boxed_slice()),
                None,
            ),
        };
        Self { prev_hash, seq, signer, verifying_key }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn head(&self) -> &str {
        &self.prev_hash
    }

    /// The Ed25519 verifying key, if entries are signed with a private key
    /// rather than the HMAC fallback.
    pub fn verifying_key(&self) -> Option<&VerifyingKey> {
        self.verifying_key.as_ref()
    }

    /// Seal `entry`: assigns `seq`, `prev`, `hash`, and `sig`, and advances
    /// the chain tip.
    pub fn seal(&mut self, mut entry: AuditEntry) -> AuditEntry {
        self.seq += 1;
        entry.seq = self.seq;
        entry.prev = self.prev_hash.clone();

        let payload = canonical_bytes(&entry);
        let hash = sha256_hex(&entry.prev, &payload);
        let sig = self.sign(&entry.prev, &payload);

        entry.hash = hash.clone();
        entry.sig = sig;
        self.prev_hash = hash;

        entry
    }

    fn sign(&self, prev: &str, payload: &[u8]) -> String {
        let mut message = prev.as_bytes().to_vec();
        message.extend_from_slice(payload);

        match &self.signer {
            Signer::Ed25519(key) => {
                let sig: Signature = key.sign(&message);
                hex::encode(sig.to_bytes())
            }
            Signer::Hmac(key) => {
                let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
                mac.update(&message);
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }
}

fn canonical_bytes(entry: &AuditEntry) -> Vec<u8> {
    serde_json::to_vec(&entry.canonical_payload()).expect("audit entry payload is serializable")
}

fn sha256_hex(prev: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Verify that `entries` (must be given in ascending `seq` order) form an
/// intact chain: linkage, recomputed hash, and — when a verifying key is
/// supplied — the detached signature.
///
/// Returns `Ok(())` if valid, or `Err` naming the first broken `seq`.
pub fn verify_chain(
    entries: &[AuditEntry],
    verifying_key: Option<&VerifyingKey>,
) -> Result<(), ChainVerificationError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 0u64;

    for entry in entries {
        expected_seq += 1;
        if entry.seq != expected_seq || entry.prev != expected_prev {
            return Err(ChainVerificationError {
                seq: entry.seq,
                expected_prev: expected_prev.clone(),
                actual_prev: entry.prev.clone(),
                expected_hash: expected_prev.clone(),
                actual_hash: entry.prev.clone(),
            });
        }

        let payload = canonical_bytes(entry);
        let recomputed = sha256_hex(&entry.prev, &payload);
        if recomputed != entry.hash {
            return Err(ChainVerificationError {
                seq: entry.seq,
                expected_prev: expected_prev.clone(),
                actual_prev: entry.prev.clone(),
                expected_hash: recomputed,
                actual_hash: entry.hash.clone(),
            });
        }

        if let Some(vk) = verifying_key {
            let mut message = entry.prev.as_bytes().to_vec();
            message.extend_from_slice(&payload);
            let bad_signature = |_| ChainVerificationError {
                seq: entry.seq,
                expected_prev: expected_prev.clone(),
                actual_prev: entry.prev.clone(),
                expected_hash: entry.hash.clone(),
                actual_hash: entry.sig.clone(),
            };
            let sig_bytes = hex::decode(&entry.sig).map_err(bad_signature)?;
            let sig = Signature::from_slice(&sig_bytes).map_err(bad_signature)?;
            if vk.verify(&message, &sig).is_err() {
                return Err(ChainVerificationError {
                    seq: entry.seq,
                    expected_prev: expected_prev.clone(),
                    actual_prev: entry.prev.clone(),
                    expected_hash: entry.hash.clone(),
                    actual_hash: entry.sig.clone(),
                });
            }
        }

        expected_prev = entry.hash.clone();
    }

    Ok(())
}

/// Describes exactly how the chain broke: at which `seq`, and the
/// expected-vs-actual value of whichever check failed first (linkage,
/// recomputed hash, or signature).
#[derive(Debug)]
pub struct ChainVerificationError {
    pub seq: u64,
    pub expected_prev: String,
    pub actual_prev: String,
    pub expected_hash: String,
    pub actual_hash: String,
}

impl std::fmt::Display for ChainVerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "audit chain broken at seq {}: expected {}, got {}",
            self.seq, self.expected_hash, self.actual_hash
        )
    }
}

impl std::error::Error for ChainVerificationError {}

impl From<ChainVerificationError> for Error {
    fn from(e: ChainVerificationError) -> Self {
        Error::Integrity(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::AuditResult;

    fn entry(action: &str) -> AuditEntry {
        AuditEntry::new("test", action, AuditResult::Ok)
    }

    #[test]
    fn genesis_seals_with_zero_prev() {
        let mut chain = AuditChain::genesis(None);
        let sealed = chain.seal(entry("first"));
        assert_eq!(sealed.seq, 1);
        assert_eq!(sealed.prev, GENESIS_HASH);
        assert!(!sealed.hash.is_empty());
        assert!(!sealed.sig.is_empty());
    }

    #[test]
    fn chain_links_sequential_entries() {
        let mut chain = AuditChain::genesis(None);
        let e1 = chain.seal(entry("a"));
        let e2 = chain.seal(entry("b"));
        assert_eq!(e2.seq, 2);
        assert_eq!(e2.prev, e1.hash);
    }

    #[test]
    fn verify_chain_accepts_valid_sequence() {
        let mut chain = AuditChain::genesis(None);
        let entries: Vec<_> = (0..5).map(|i| chain.seal(entry(&format!("a{i}")))).collect();
        assert!(verify_chain(&entries, None).is_ok());
    }

    #[test]
    fn verify_chain_detects_tampered_hash() {
        let mut chain = AuditChain::genesis(None);
        let mut entries: Vec<_> = (0..3).map(|i| chain.seal(entry(&format!("a{i}")))).collect();
        let mut byte = entries[1].hash.into_bytes();
        byte[0] = if byte[0] == b'a' { b'b' } else { b'a' };
        entries[1].hash = String::from_utf8(byte).unwrap();

        let err = verify_chain(&entries, None).unwrap_err();
        assert_eq!(err.seq, 2);
    }

    #[test]
    fn ed25519_signatures_verify() {
        use rand::rngs::OsRng;
        let key = SigningKey::generate(&mut OsRng);
        let vk = key.verifying_key();
        let mut chain = AuditChain::genesis(Some(key));
        let entries: Vec<_> = (0..3).map(|i| chain.seal(entry(&format!("a{i}")))).collect();
        assert!(verify_chain(&entries, Some(&vk)).is_ok());
    }

    #[test]
    fn resume_continues_sequence() {
        let mut chain = AuditChain::genesis(None);
        let e1 = chain.seal(entry("a"));
        let mut resumed = AuditChain::resume(e1.hash.clone(), e1.seq, None);
        let e2 = resumed.seal(entry("b"));
        assert_eq!(e2.seq, 2);
        assert_eq!(e2.prev, e1.hash);
    }
}
