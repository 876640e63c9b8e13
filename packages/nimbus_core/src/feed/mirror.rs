//! Read-only replicas of remote feeds
//!
//! Entries arrive from peers in any order. An entry is committed only when
//! it links onto the verified chain; entries from beyond a gap are checked
//! standalone and parked until the gap fills.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::chain::FeedLog;
use super::entry::{extend_root, FeedEntry};
use super::keys::FeedPublicKey;
use super::storage::{FeedStorage, MemoryStorage};
use super::{AuditReport, Feed, FeedError, FeedHead};

/// What happened to a received entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The entry, plus any parked entries it unblocked, were committed.
    Accepted { committed: Range<u64> },
    /// The entry verified on its own but sits beyond a gap.
    Buffered { next_missing: u64 },
    /// Already held, with the same hash.
    Duplicate,
}

/// Replication progress relative to what the mirror knows exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Holds every entry it knows about.
    CaughtUp,
    /// Knows of entries it has not yet committed.
    Syncing { next_missing: u64, known_length: u64 },
}

struct MirrorState {
    chain: FeedLog,
    /// Standalone-verified entries waiting for a gap to fill.
    pending: BTreeMap<u64, FeedEntry>,
    /// Highest length announced by a peer or implied by a parked entry.
    known_length: u64,
}

impl MirrorState {
    fn sync_state(&self) -> SyncState {
        let len = self.chain.len();
        if len >= self.known_length {
            SyncState::CaughtUp
        } else {
            SyncState::Syncing {
                next_missing: len,
                known_length: self.known_length,
            }
        }
    }
}

/// A verified replica of someone else's feed.
pub struct MirroredFeed {
    key: FeedPublicKey,
    state: RwLock<MirrorState>,
    storage: Arc<dyn FeedStorage>,
}

impl MirroredFeed {
    /// An empty in-memory mirror.
    pub fn new(key: FeedPublicKey) -> Self {
        Self {
            key,
            state: RwLock::new(MirrorState {
                chain: FeedLog::new(key),
                pending: BTreeMap::new(),
                known_length: 0,
            }),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Rebuild a mirror from storage.
    ///
    /// Entries are loaded as stored; run [`Feed::audit`] to find tampering.
    pub fn open(key: FeedPublicKey, storage: Arc<dyn FeedStorage>) -> Result<Self, FeedError> {
        let chain = FeedLog::from_entries(key, storage.load()?);
        let known_length = chain.len();
        log::info!("[mirror {}] opened with {} entries", key.short(), known_length);
        Ok(Self {
            key,
            state: RwLock::new(MirrorState {
                chain,
                pending: BTreeMap::new(),
                known_length,
            }),
            storage,
        })
    }

    /// Offer an entry received from a peer.
    ///
    /// Entries that fail verification are dropped and reported as
    /// `VerificationFailure`; entries that contradict already committed
    /// history are reported as `Divergence`. Neither changes the mirror.
    pub fn receive(&self, entry: FeedEntry) -> Result<ReceiveOutcome, FeedError> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        let len = state.chain.len();
        let index = entry.index;

        if index < len {
            return match state.chain.get(index) {
                Some(held) if held.hash == entry.hash => Ok(ReceiveOutcome::Duplicate),
                _ => {
                    log::warn!("[mirror {}] divergent entry at {}", self.key.short(), index);
                    Err(FeedError::Divergence { index })
                }
            };
        }

        if let Err(fault) = entry.verify_standalone(&self.key) {
            log::warn!(
                "[mirror {}] dropping entry {}: {}",
                self.key.short(),
                index,
                fault
            );
            return Err(FeedError::VerificationFailure {
                index,
                reason: fault.to_string(),
            });
        }

        if index > len {
            if let Some(parked) = state.pending.get(&index) {
                return if parked.hash == entry.hash {
                    Ok(ReceiveOutcome::Duplicate)
                } else {
                    Err(FeedError::Divergence { index })
                };
            }
            log::debug!(
                "[mirror {}] parking entry {} behind gap at {}",
                self.key.short(),
                index,
                len
            );
            state.pending.insert(index, entry);
            state.known_length = state.known_length.max(index + 1);
            return Ok(ReceiveOutcome::Buffered { next_missing: len });
        }

        self.commit(state, entry)?;
        loop {
            let next_index = state.chain.len();
            let Some(next) = state.pending.remove(&next_index) else {
                break;
            };
            if let Err(e) = self.commit(state, next) {
                // A parked entry that does not link onto the chain means the
                // writer signed two histories.
                state.pending.clear();
                return Err(match e {
                    FeedError::VerificationFailure { .. } => {
                        FeedError::Divergence { index: next_index }
                    }
                    other => other,
                });
            }
        }

        let committed = len..state.chain.len();
        state.known_length = state.known_length.max(committed.end);
        Ok(ReceiveOutcome::Accepted { committed })
    }

    fn commit(&self, state: &mut MirrorState, entry: FeedEntry) -> Result<(), FeedError> {
        let index = state.chain.len();
        entry
            .verify_linked(&self.key, index, &state.chain.tip_hash())
            .map_err(|fault| FeedError::VerificationFailure {
                index,
                reason: fault.to_string(),
            })?;

        let head = FeedHead {
            length: index + 1,
            hash: entry.hash,
            root: extend_root(&state.chain.root(), &entry.hash),
        };
        self.storage.append(&entry, &head)?;
        state.chain.push(entry);
        Ok(())
    }

    /// Record a head a peer claims for this feed.
    ///
    /// A head at or below our length must match our chain at that point;
    /// otherwise the remote history has diverged. A longer head marks the
    /// mirror as syncing until it catches up.
    pub fn note_remote_head(&self, head: &FeedHead) -> Result<(), FeedError> {
        let mut state = self.write_state()?;
        let len = state.chain.len();

        if head.length <= len {
            let matches = state
                .chain
                .head_at(head.length)
                .map(|local| local.hash == head.hash && local.root == head.root)
                .unwrap_or(false);
            if !matches {
                let index = head.latest_index().unwrap_or(0);
                log::warn!(
                    "[mirror {}] remote head at {} contradicts local chain",
                    self.key.short(),
                    head.length
                );
                return Err(FeedError::Divergence { index });
            }
            return Ok(());
        }

        if let Some(index) = head.latest_index() {
            if let Some(parked) = state.pending.get(&index) {
                if parked.hash != head.hash {
                    return Err(FeedError::Divergence { index });
                }
            }
        }
        state.known_length = state.known_length.max(head.length);
        Ok(())
    }

    /// The next contiguous range this mirror needs, if any.
    pub fn missing(&self) -> Option<Range<u64>> {
        let state = self.state.read().ok()?;
        let len = state.chain.len();
        if len >= state.known_length {
            return None;
        }
        let end = state
            .pending
            .keys()
            .next()
            .copied()
            .unwrap_or(state.known_length);
        Some(len..end)
    }

    pub fn sync_state(&self) -> SyncState {
        self.state
            .read()
            .map(|s| s.sync_state())
            .unwrap_or(SyncState::CaughtUp)
    }

    pub fn known_length(&self) -> u64 {
        self.state.read().map(|s| s.known_length).unwrap_or(0)
    }

    /// Drop all history so the feed can be resynchronized from index 0.
    pub fn reset(&self) -> Result<(), FeedError> {
        let mut state = self.write_state()?;
        self.storage.truncate()?;
        state.chain.clear();
        state.pending.clear();
        state.known_length = 0;
        log::info!("[mirror {}] reset for resync", self.key.short());
        Ok(())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, MirrorState>, FeedError> {
        self.state
            .read()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, MirrorState>, FeedError> {
        self.state
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))
    }
}

impl Feed for MirroredFeed {
    fn key(&self) -> FeedPublicKey {
        self.key
    }

    fn len(&self) -> u64 {
        self.state.read().map(|s| s.chain.len()).unwrap_or(0)
    }

    fn entry(&self, index: u64) -> Result<FeedEntry, FeedError> {
        let state = self.read_state()?;
        if let Some(entry) = state.chain.get(index) {
            return Ok(entry.clone());
        }
        let length = state.chain.len();
        if index < state.known_length {
            Err(FeedError::GapBlocked {
                index,
                next_missing: length,
            })
        } else {
            Err(FeedError::OutOfRange { index, length })
        }
    }

    fn verify(&self, index: u64) -> bool {
        self.state
            .read()
            .map(|s| s.chain.verify(index))
            .unwrap_or(false)
    }

    fn audit(&self) -> AuditReport {
        match self.state.read() {
            Ok(state) => state.chain.audit(),
            Err(_) => AuditReport {
                valid_count: 0,
                first_invalid_index: Some(0),
            },
        }
    }

    fn head(&self) -> FeedHead {
        self.state
            .read()
            .map(|s| s.chain.head())
            .unwrap_or_else(|_| FeedHead::empty())
    }

    fn head_at(&self, length: u64) -> Option<FeedHead> {
        self.state.read().ok().and_then(|s| s.chain.head_at(length))
    }

    fn is_writable(&self) -> bool {
        false
    }
}
