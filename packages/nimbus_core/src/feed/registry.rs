//! Feed registry
//!
//! Owns every feed a node holds, keyed by public key. With a store root the
//! registry lays feeds out as:
//!
//! ```text
//! {root}/keys/{key}.json     signing key of each local feed
//! {root}/feeds/{key}/        entries.log + meta.json
//! ```
//!
//! Without a root everything lives in memory.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::keys::{FeedKeypair, FeedPublicKey};
use super::local::LocalFeed;
use super::mirror::MirroredFeed;
use super::storage::{FeedStorage, FileStorage};
use super::{Feed, FeedError, FeedHead};

/// One line of [`FeedRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    pub key: FeedPublicKey,
    pub writable: bool,
    pub head: FeedHead,
}

pub struct FeedRegistry {
    root: Option<PathBuf>,
    local: RwLock<HashMap<FeedPublicKey, Arc<LocalFeed>>>,
    mirrors: RwLock<HashMap<FeedPublicKey, Arc<MirroredFeed>>>,
}

impl FeedRegistry {
    /// A registry whose feeds live only in memory.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            local: RwLock::new(HashMap::new()),
            mirrors: RwLock::new(HashMap::new()),
        }
    }

    /// A registry persisting feeds under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self, FeedError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("feeds"))
            .and_then(|_| std::fs::create_dir_all(root.join("keys")))
            .map_err(|e| FeedError::IoError(e.to_string()))?;
        Ok(Self {
            root: Some(root),
            local: RwLock::new(HashMap::new()),
            mirrors: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn key_path(root: &Path, key: &FeedPublicKey) -> PathBuf {
        root.join("keys").join(format!("{}.json", key.to_hex()))
    }

    fn storage_for(&self, key: FeedPublicKey) -> Result<Option<Arc<dyn FeedStorage>>, FeedError> {
        match &self.root {
            Some(root) => {
                let dir = FileStorage::feed_dir(&root.join("feeds"), &key);
                let storage: Arc<dyn FeedStorage> = Arc::new(FileStorage::open(&dir, key)?);
                Ok(Some(storage))
            }
            None => Ok(None),
        }
    }

    /// Create a new writable feed, persisting its key when backed by disk.
    pub fn create_local(&self, keypair: Option<FeedKeypair>) -> Result<Arc<LocalFeed>, FeedError> {
        let keypair = keypair.unwrap_or_else(FeedKeypair::generate);
        let key = keypair.public_key();

        let feed = match (&self.root, self.storage_for(key)?) {
            (Some(root), Some(storage)) => {
                keypair.save(&Self::key_path(root, &key))?;
                LocalFeed::open(keypair, storage)?
            }
            _ => LocalFeed::create(Some(keypair)),
        };

        let feed = Arc::new(feed);
        self.local
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?
            .insert(key, Arc::clone(&feed));
        log::info!("Created local feed {}", key);
        Ok(feed)
    }

    /// Reopen a local feed from disk.
    pub fn open_local(&self, key: &FeedPublicKey) -> Result<Arc<LocalFeed>, FeedError> {
        if let Some(feed) = self.get_local(key) {
            return Ok(feed);
        }
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| FeedError::NotFound(format!("local feed {}", key)))?;
        let key_path = Self::key_path(root, key);
        if !key_path.exists() {
            return Err(FeedError::NotFound(format!("local feed {}", key)));
        }

        let keypair = FeedKeypair::load(&key_path)?;
        let storage = self
            .storage_for(*key)?
            .ok_or_else(|| FeedError::NotFound(format!("local feed {}", key)))?;
        let feed = Arc::new(LocalFeed::open(keypair, storage)?);
        self.local
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?
            .insert(*key, Arc::clone(&feed));
        Ok(feed)
    }

    /// Return the mirror of `key`, creating or reloading it as needed.
    pub fn open_mirror(&self, key: FeedPublicKey) -> Result<Arc<MirroredFeed>, FeedError> {
        let mut mirrors = self
            .mirrors
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?;
        if let Some(feed) = mirrors.get(&key) {
            return Ok(Arc::clone(feed));
        }

        let feed = match self.storage_for(key)? {
            Some(storage) => MirroredFeed::open(key, storage)?,
            None => MirroredFeed::new(key),
        };
        let feed = Arc::new(feed);
        mirrors.insert(key, Arc::clone(&feed));
        log::debug!("Opened mirror of feed {}", key.short());
        Ok(feed)
    }

    pub fn get_local(&self, key: &FeedPublicKey) -> Option<Arc<LocalFeed>> {
        self.local.read().ok()?.get(key).cloned()
    }

    pub fn get_mirror(&self, key: &FeedPublicKey) -> Option<Arc<MirroredFeed>> {
        self.mirrors.read().ok()?.get(key).cloned()
    }

    /// Any open feed with this key, local first.
    pub fn get(&self, key: &FeedPublicKey) -> Option<Arc<dyn Feed>> {
        if let Some(feed) = self.get_local(key) {
            return Some(feed as Arc<dyn Feed>);
        }
        self.get_mirror(key).map(|f| f as Arc<dyn Feed>)
    }

    /// Every open feed, sorted by key.
    pub fn list(&self) -> Vec<FeedSummary> {
        let mut out = Vec::new();
        if let Ok(local) = self.local.read() {
            out.extend(local.values().map(|f| FeedSummary {
                key: f.key(),
                writable: f.is_writable(),
                head: f.head(),
            }));
        }
        if let Ok(mirrors) = self.mirrors.read() {
            out.extend(mirrors.values().map(|f| FeedSummary {
                key: f.key(),
                writable: false,
                head: f.head(),
            }));
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Close a local feed and forget it. Mirrors are simply dropped.
    pub fn close_feed(&self, key: &FeedPublicKey) -> Result<(), FeedError> {
        let local = self
            .local
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?
            .remove(key);
        if let Some(feed) = local {
            return feed.close();
        }
        let mirror = self
            .mirrors
            .write()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?
            .remove(key);
        match mirror {
            Some(_) => Ok(()),
            None => Err(FeedError::NotFound(format!("feed {}", key))),
        }
    }

    /// Append a file to a local feed as fixed-size chunks.
    ///
    /// Returns the indices the chunks landed at. An empty file appends
    /// nothing.
    pub async fn distribute_file(
        &self,
        key: &FeedPublicKey,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Range<u64>, FeedError> {
        let feed = self
            .get_local(key)
            .ok_or_else(|| FeedError::NotFound(format!("local feed {}", key)))?;
        if chunk_size == 0 {
            return Err(FeedError::IoError("chunk size must be positive".to_string()));
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| FeedError::IoError(format!("{}: {}", path.display(), e)))?;
        let range = feed.append_batch(data.chunks(chunk_size).map(|c| c.to_vec()))?;
        log::info!(
            "Distributed {} ({} bytes) as entries {}..{} of {}",
            path.display(),
            data.len(),
            range.start,
            range.end,
            key.short()
        );
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_create_and_list() {
        let registry = FeedRegistry::in_memory();
        let a = registry.create_local(None).unwrap();
        let b = registry.create_local(None).unwrap();
        a.append(b"x".to_vec()).unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert!(listed.windows(2).all(|w| w[0].key < w[1].key));
        assert!(listed.iter().all(|s| s.writable));

        let found = registry.get(&a.key()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(registry.get(&b.key()).unwrap().is_empty());
    }

    #[test]
    fn test_persistent_local_feed_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let key;
        {
            let registry = FeedRegistry::with_root(dir.path()).unwrap();
            let feed = registry.create_local(None).unwrap();
            feed.append(b"one".to_vec()).unwrap();
            key = feed.key();
        }

        let registry = FeedRegistry::with_root(dir.path()).unwrap();
        let feed = registry.open_local(&key).unwrap();
        assert_eq!(feed.get(0).unwrap(), b"one");
        assert_eq!(feed.append(b"two".to_vec()).unwrap(), 1);
    }

    #[test]
    fn test_open_unknown_local_feed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FeedRegistry::with_root(dir.path()).unwrap();
        let key = FeedKeypair::generate().public_key();
        assert!(matches!(
            registry.open_local(&key),
            Err(FeedError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_mirror_is_shared() {
        let registry = FeedRegistry::in_memory();
        let key = FeedKeypair::generate().public_key();
        let first = registry.open_mirror(key).unwrap();
        let second = registry.open_mirror(key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!registry.list()[0].writable);
    }

    #[test]
    fn test_close_feed() {
        let registry = FeedRegistry::in_memory();
        let feed = registry.create_local(None).unwrap();
        let key = feed.key();
        registry.close_feed(&key).unwrap();
        assert!(feed.is_closed());
        assert!(registry.get_local(&key).is_none());
        assert!(matches!(
            registry.close_feed(&key),
            Err(FeedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_distribute_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(&path, &data).unwrap();

        let registry = FeedRegistry::in_memory();
        let feed = registry.create_local(None).unwrap();
        let range = registry
            .distribute_file(&feed.key(), &path, 300)
            .await
            .unwrap();

        assert_eq!(range, 0..4);
        let rebuilt: Vec<u8> = range.flat_map(|i| feed.get(i).unwrap()).collect();
        assert_eq!(rebuilt, data);
        assert_eq!(feed.get(3).unwrap().len(), 100);
    }
}
