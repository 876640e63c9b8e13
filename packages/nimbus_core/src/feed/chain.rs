//! In-memory hash chain shared by local and mirrored feeds.

use super::entry::{extend_root, EntryHash, FeedEntry, GENESIS_HASH};
use super::keys::FeedPublicKey;
use super::{AuditReport, FeedHead};

/// Ordered entries of one feed plus the root accumulated after each entry.
///
/// `roots[i]` is the root after entry `i` has been folded in, so the head of
/// any prefix can be answered in O(1).
pub(crate) struct FeedLog {
    key: FeedPublicKey,
    entries: Vec<FeedEntry>,
    roots: Vec<EntryHash>,
}

impl FeedLog {
    pub(crate) fn new(key: FeedPublicKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Rebuild from persisted entries without verifying them.
    ///
    /// Tampered entries stay visible to `verify` / `audit`.
    pub(crate) fn from_entries(key: FeedPublicKey, entries: Vec<FeedEntry>) -> Self {
        let mut log = Self::new(key);
        for entry in entries {
            log.push(entry);
        }
        log
    }

    pub(crate) fn key(&self) -> FeedPublicKey {
        self.key
    }

    pub(crate) fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub(crate) fn get(&self, index: u64) -> Option<&FeedEntry> {
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    /// Hash the next appended entry must link to.
    pub(crate) fn tip_hash(&self) -> EntryHash {
        self.entries.last().map(|e| e.hash).unwrap_or(GENESIS_HASH)
    }

    pub(crate) fn root(&self) -> EntryHash {
        self.roots.last().copied().unwrap_or(GENESIS_HASH)
    }

    pub(crate) fn head(&self) -> FeedHead {
        FeedHead {
            length: self.len(),
            hash: self.tip_hash(),
            root: self.root(),
        }
    }

    /// Head of the prefix of the given length, if this log is that long.
    pub(crate) fn head_at(&self, length: u64) -> Option<FeedHead> {
        if length == 0 {
            return Some(FeedHead::empty());
        }
        let i = usize::try_from(length - 1).ok()?;
        let entry = self.entries.get(i)?;
        Some(FeedHead {
            length,
            hash: entry.hash,
            root: self.roots[i],
        })
    }

    /// Append an entry the caller has already verified.
    pub(crate) fn push(&mut self, entry: FeedEntry) {
        let root = extend_root(&self.root(), &entry.hash);
        self.entries.push(entry);
        self.roots.push(root);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.roots.clear();
    }

    /// Recompute the entry at `index` and its link to `index - 1`.
    pub(crate) fn verify(&self, index: u64) -> bool {
        let Some(entry) = self.get(index) else {
            return false;
        };
        let prev = if index == 0 {
            GENESIS_HASH
        } else {
            match self.get(index - 1) {
                Some(p) => p.hash,
                None => return false,
            }
        };
        entry.verify_linked(&self.key, index, &prev).is_ok()
    }

    /// Walk the chain from the start, stopping at the first bad entry.
    pub(crate) fn audit(&self) -> AuditReport {
        let mut prev = GENESIS_HASH;
        for (i, entry) in self.entries.iter().enumerate() {
            let index = i as u64;
            if entry.verify_linked(&self.key, index, &prev).is_err() {
                return AuditReport {
                    valid_count: index,
                    first_invalid_index: Some(index),
                };
            }
            prev = entry.hash;
        }
        AuditReport {
            valid_count: self.len(),
            first_invalid_index: None,
        }
    }
}
