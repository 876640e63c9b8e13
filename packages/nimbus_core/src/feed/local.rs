//! The writable copy of a feed.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::chain::FeedLog;
use super::entry::{extend_root, FeedEntry};
use super::keys::{FeedKeypair, FeedPublicKey};
use super::storage::{FeedStorage, MemoryStorage};
use super::{AuditReport, Feed, FeedError, FeedHead};

/// A feed owned by this process: holds the signing key and accepts appends.
///
/// Appends are serialized by the chain's write lock, so concurrent callers
/// each get a distinct index with no gaps. An entry is committed to storage
/// before it becomes visible to readers.
pub struct LocalFeed {
    keypair: FeedKeypair,
    chain: RwLock<FeedLog>,
    storage: Arc<dyn FeedStorage>,
    closed: AtomicBool,
}

impl LocalFeed {
    /// Create an in-memory feed, generating a keypair if none is supplied.
    pub fn create(keypair: Option<FeedKeypair>) -> Self {
        let keypair = keypair.unwrap_or_else(FeedKeypair::generate);
        let key = keypair.public_key();
        Self {
            keypair,
            chain: RwLock::new(FeedLog::new(key)),
            storage: Arc::new(MemoryStorage::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a feed over existing storage, rebuilding the chain.
    ///
    /// Fails if the stored chain does not audit cleanly: a writer must not
    /// extend history it cannot vouch for.
    pub fn open(keypair: FeedKeypair, storage: Arc<dyn FeedStorage>) -> Result<Self, FeedError> {
        let key = keypair.public_key();
        let chain = FeedLog::from_entries(key, storage.load()?);

        let report = chain.audit();
        if let Some(index) = report.first_invalid_index {
            log::warn!("[feed {}] stored chain invalid at index {}", key.short(), index);
            return Err(FeedError::VerificationFailure {
                index,
                reason: "stored chain failed audit".to_string(),
            });
        }

        log::info!("[feed {}] opened with {} entries", key.short(), chain.len());
        Ok(Self {
            keypair,
            chain: RwLock::new(chain),
            storage,
            closed: AtomicBool::new(false),
        })
    }

    pub fn keypair(&self) -> &FeedKeypair {
        &self.keypair
    }

    /// Append a payload, returning its index.
    pub fn append(&self, payload: impl Into<Vec<u8>>) -> Result<u64, FeedError> {
        let mut chain = self.write_chain()?;
        self.append_locked(&mut chain, payload.into())
    }

    /// Append several payloads as one contiguous run of indices.
    ///
    /// No other append can interleave. If storage fails partway, the entries
    /// already written stay committed and the error is returned.
    pub fn append_batch<I, P>(&self, payloads: I) -> Result<Range<u64>, FeedError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let mut chain = self.write_chain()?;
        let start = chain.len();
        for payload in payloads {
            self.append_locked(&mut chain, payload.into())?;
        }
        Ok(start..chain.len())
    }

    fn append_locked(&self, chain: &mut FeedLog, payload: Vec<u8>) -> Result<u64, FeedError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FeedError::Closed);
        }

        let index = chain.len();
        let entry = FeedEntry::new_signed(index, chain.tip_hash(), payload, &self.keypair);
        let head = FeedHead {
            length: index + 1,
            hash: entry.hash,
            root: extend_root(&chain.root(), &entry.hash),
        };

        self.storage.append(&entry, &head)?;
        chain.push(entry);

        log::debug!("[feed {}] appended index {}", chain.key().short(), index);
        Ok(index)
    }

    /// Stop accepting appends.
    ///
    /// Waits for an in-flight append to finish, so no index is half
    /// committed. Reads keep working. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), FeedError> {
        let _chain = self.write_chain()?;
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("[feed {}] closed", self.keypair.public_key().short());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn read_chain(&self) -> Result<RwLockReadGuard<'_, FeedLog>, FeedError> {
        self.chain
            .read()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))
    }

    fn write_chain(&self) -> Result<RwLockWriteGuard<'_, FeedLog>, FeedError> {
        self.chain
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))
    }
}

impl Feed for LocalFeed {
    fn key(&self) -> FeedPublicKey {
        self.keypair.public_key()
    }

    fn len(&self) -> u64 {
        self.chain.read().map(|c| c.len()).unwrap_or(0)
    }

    fn entry(&self, index: u64) -> Result<FeedEntry, FeedError> {
        let chain = self.read_chain()?;
        chain.get(index).cloned().ok_or(FeedError::OutOfRange {
            index,
            length: chain.len(),
        })
    }

    fn verify(&self, index: u64) -> bool {
        self.chain.read().map(|c| c.verify(index)).unwrap_or(false)
    }

    fn audit(&self) -> AuditReport {
        match self.chain.read() {
            Ok(chain) => chain.audit(),
            Err(_) => AuditReport {
                valid_count: 0,
                first_invalid_index: Some(0),
            },
        }
    }

    fn head(&self) -> FeedHead {
        self.chain
            .read()
            .map(|c| c.head())
            .unwrap_or_else(|_| FeedHead::empty())
    }

    fn head_at(&self, length: u64) -> Option<FeedHead> {
        self.chain.read().ok().and_then(|c| c.head_at(length))
    }

    fn is_writable(&self) -> bool {
        !self.is_closed()
    }
}
