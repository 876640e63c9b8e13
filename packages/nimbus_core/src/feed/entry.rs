//! Feed entries and the hash chain
//!
//! Each entry commits to its index, the previous entry's hash and its
//! payload. The entry hash is signed by the feed key. A running root hash
//! accumulates every entry hash so two copies of a feed can be compared
//! without transferring history.

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::keys::{FeedKeypair, FeedPublicKey};

/// SHA-256 digest used for entry hashes and roots.
pub type EntryHash = [u8; 32];

/// Chain link of entry 0, and the root of an empty feed.
pub const GENESIS_HASH: EntryHash = [0u8; 32];

/// An immutable, indexed, hash-linked payload within a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// 0-based position in the feed.
    pub index: u64,
    /// Hash of the entry at `index - 1`, or [`GENESIS_HASH`] for index 0.
    pub prev_hash: EntryHash,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// `compute_hash(index, prev_hash, payload)`.
    pub hash: EntryHash,
    /// Signature over `hash` by the feed key.
    pub signature: Signature,
}

/// Why an entry failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFault {
    HashMismatch,
    BrokenLink,
    BadSignature,
    WrongIndex { expected: u64 },
}

impl std::fmt::Display for EntryFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryFault::HashMismatch => f.write_str("content hash mismatch"),
            EntryFault::BrokenLink => f.write_str("chain link does not match previous entry"),
            EntryFault::BadSignature => f.write_str("signature does not verify against feed key"),
            EntryFault::WrongIndex { expected } => write!(f, "expected index {}", expected),
        }
    }
}

impl FeedEntry {
    /// Hash of an entry's content.
    ///
    /// The payload is length-prefixed so that `(index, payload)` pairs can
    /// never collide by shifting bytes between fields.
    pub fn compute_hash(index: u64, prev_hash: &EntryHash, payload: &[u8]) -> EntryHash {
        let mut hasher = Sha256::new();
        hasher.update(b"nimbus.entry");
        hasher.update(index.to_be_bytes());
        hasher.update(prev_hash);
        hasher.update((payload.len() as u64).to_be_bytes());
        hasher.update(payload);
        hasher.finalize().into()
    }

    /// Build and sign the entry that follows `prev_hash` at `index`.
    pub fn new_signed(
        index: u64,
        prev_hash: EntryHash,
        payload: Vec<u8>,
        keypair: &FeedKeypair,
    ) -> Self {
        let hash = Self::compute_hash(index, &prev_hash, &payload);
        let signature = keypair.sign(&hash);
        Self {
            index,
            prev_hash,
            payload,
            hash,
            signature,
        }
    }

    /// Check the content hash and signature, ignoring the chain link.
    ///
    /// This is all that can be checked for an entry that arrives ahead of a
    /// gap.
    pub fn verify_standalone(&self, key: &FeedPublicKey) -> Result<(), EntryFault> {
        if Self::compute_hash(self.index, &self.prev_hash, &self.payload) != self.hash {
            return Err(EntryFault::HashMismatch);
        }
        if !key.verify(&self.hash, &self.signature) {
            return Err(EntryFault::BadSignature);
        }
        Ok(())
    }

    /// Full verification: hash, signature, position and chain link.
    pub fn verify_linked(
        &self,
        key: &FeedPublicKey,
        expected_index: u64,
        prev_hash: &EntryHash,
    ) -> Result<(), EntryFault> {
        if self.index != expected_index {
            return Err(EntryFault::WrongIndex {
                expected: expected_index,
            });
        }
        if &self.prev_hash != prev_hash {
            return Err(EntryFault::BrokenLink);
        }
        self.verify_standalone(key)
    }
}

/// Fold one entry hash into the running root.
pub fn extend_root(root: &EntryHash, entry_hash: &EntryHash) -> EntryHash {
    let mut hasher = Sha256::new();
    hasher.update(b"nimbus.root");
    hasher.update(root);
    hasher.update(entry_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = FeedEntry::compute_hash(3, &GENESIS_HASH, b"payload");
        let b = FeedEntry::compute_hash(3, &GENESIS_HASH, b"payload");
        assert_eq!(a, b);

        // Index participates in the hash.
        assert_ne!(a, FeedEntry::compute_hash(4, &GENESIS_HASH, b"payload"));
    }

    #[test]
    fn test_signed_entry_verifies() {
        let keypair = FeedKeypair::generate();
        let entry = FeedEntry::new_signed(0, GENESIS_HASH, b"hello".to_vec(), &keypair);
        assert!(entry
            .verify_linked(&keypair.public_key(), 0, &GENESIS_HASH)
            .is_ok());
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let keypair = FeedKeypair::generate();
        let mut entry = FeedEntry::new_signed(0, GENESIS_HASH, b"hello".to_vec(), &keypair);
        entry.payload = b"hellp".to_vec();
        assert_eq!(
            entry.verify_standalone(&keypair.public_key()),
            Err(EntryFault::HashMismatch)
        );
    }

    #[test]
    fn test_foreign_signature_detected() {
        let keypair = FeedKeypair::generate();
        let impostor = FeedKeypair::generate();
        let entry = FeedEntry::new_signed(0, GENESIS_HASH, b"hello".to_vec(), &impostor);
        assert_eq!(
            entry.verify_standalone(&keypair.public_key()),
            Err(EntryFault::BadSignature)
        );
    }

    #[test]
    fn test_broken_link_detected() {
        let keypair = FeedKeypair::generate();
        let first = FeedEntry::new_signed(0, GENESIS_HASH, b"a".to_vec(), &keypair);
        let second = FeedEntry::new_signed(1, [7u8; 32], b"b".to_vec(), &keypair);
        assert_eq!(
            second.verify_linked(&keypair.public_key(), 1, &first.hash),
            Err(EntryFault::BrokenLink)
        );
    }

    #[test]
    fn test_root_depends_on_order() {
        let h1 = [1u8; 32];
        let h2 = [2u8; 32];
        let forward = extend_root(&extend_root(&GENESIS_HASH, &h1), &h2);
        let backward = extend_root(&extend_root(&GENESIS_HASH, &h2), &h1);
        assert_ne!(forward, backward);
    }
}
