//! Verifiable Feeds
//!
//! A feed is a single-writer, append-only, hash-chained sequence of
//! entries identified by a public key. [`LocalFeed`] is the writable copy
//! held by the key owner; [`MirroredFeed`] is a read-only replica that only
//! accepts entries which verify against the chain it already holds.
//!
//! Both variants expose the read capabilities through the [`Feed`] trait.

mod chain;
mod entry;
mod keys;
mod local;
mod mirror;
mod registry;
mod storage;

pub use entry::{extend_root, EntryFault, EntryHash, FeedEntry, GENESIS_HASH};
pub use keys::{FeedKeypair, FeedPublicKey};
pub use local::LocalFeed;
pub use mirror::{MirroredFeed, ReceiveOutcome, SyncState};
pub use registry::{FeedRegistry, FeedSummary};
pub use storage::{FeedMeta, FeedStorage, FileStorage, MemoryStorage};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Index {index} out of range (length {length})")]
    OutOfRange { index: u64, length: u64 },

    #[error("Index {index} is waiting on missing entries from {next_missing}")]
    GapBlocked { index: u64, next_missing: u64 },

    #[error("Verification failure at index {index}: {reason}")]
    VerificationFailure { index: u64, reason: String },

    #[error("Divergence at index {index}: remote history contradicts local chain")]
    Divergence { index: u64 },

    #[error("Feed is not writable")]
    NotWritable,

    #[error("Feed is closed")]
    Closed,

    #[error("Feed not found: {0}")]
    NotFound(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Latest committed position of a feed.
///
/// Two copies of a feed with equal heads hold identical histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedHead {
    /// Number of committed entries.
    pub length: u64,
    /// Hash of the entry at `length - 1` ([`GENESIS_HASH`] when empty).
    pub hash: EntryHash,
    /// Root accumulated over every entry.
    pub root: EntryHash,
}

impl FeedHead {
    pub fn empty() -> Self {
        Self {
            length: 0,
            hash: GENESIS_HASH,
            root: GENESIS_HASH,
        }
    }

    /// Index of the latest entry, if any.
    pub fn latest_index(&self) -> Option<u64> {
        self.length.checked_sub(1)
    }
}

/// Result of walking a feed's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Entries verified before the first inconsistency.
    pub valid_count: u64,
    /// Position of the first entry that failed, if any.
    pub first_invalid_index: Option<u64>,
}

impl AuditReport {
    pub fn is_valid(&self) -> bool {
        self.first_invalid_index.is_none()
    }
}

/// Read capabilities shared by local and mirrored feeds.
pub trait Feed: Send + Sync {
    /// The feed's permanent identity.
    fn key(&self) -> FeedPublicKey;

    /// Number of verified, committed entries.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload at `index`.
    fn get(&self, index: u64) -> Result<Vec<u8>, FeedError> {
        self.entry(index).map(|e| e.payload)
    }

    /// Full entry at `index`, including hash and signature.
    fn entry(&self, index: u64) -> Result<FeedEntry, FeedError>;

    /// Recheck one entry and its chain link. Never fails loudly.
    fn verify(&self, index: u64) -> bool;

    /// Walk the whole chain.
    fn audit(&self) -> AuditReport;

    fn head(&self) -> FeedHead;

    /// Head of the prefix of `length` entries, if held.
    fn head_at(&self, length: u64) -> Option<FeedHead>;

    fn is_writable(&self) -> bool;
}
