//! Feed persistence
//!
//! A feed's storage is an ordered append log plus index metadata. The log
//! holds one length-prefixed CBOR record per entry; `meta.json` records the
//! key, length, head hash and root so a restart can cross-check what it
//! rebuilt.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::entry::FeedEntry;
use super::keys::FeedPublicKey;
use super::{FeedError, FeedHead};

const ENTRIES_FILE: &str = "entries.log";
const META_FILE: &str = "meta.json";

/// Persistence collaborator for a single feed.
pub trait FeedStorage: Send + Sync {
    /// Durably record an entry. Called in index order.
    ///
    /// On error nothing of the entry may remain, so the same index can be
    /// appended again.
    fn append(&self, entry: &FeedEntry, head: &FeedHead) -> Result<(), FeedError>;

    /// Every stored entry, in index order.
    fn load(&self) -> Result<Vec<FeedEntry>, FeedError>;

    /// Drop every stored entry (resync from index 0).
    fn truncate(&self) -> Result<(), FeedError>;
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<Vec<FeedEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedStorage for MemoryStorage {
    fn append(&self, entry: &FeedEntry, _head: &FeedHead) -> Result<(), FeedError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?;
        entries.push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<FeedEntry>, FeedError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?;
        Ok(entries.clone())
    }

    fn truncate(&self) -> Result<(), FeedError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?;
        entries.clear();
        Ok(())
    }
}

/// Index metadata written next to the entry log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMeta {
    pub key: String,
    pub length: u64,
    pub head_hash: String,
    pub root: String,
}

impl FeedMeta {
    fn new(key: &FeedPublicKey, head: &FeedHead) -> Self {
        Self {
            key: key.to_hex(),
            length: head.length,
            head_hash: hex::encode(head.hash),
            root: hex::encode(head.root),
        }
    }
}

/// Directory-backed storage: `{dir}/entries.log` + `{dir}/meta.json`.
pub struct FileStorage {
    dir: PathBuf,
    key: FeedPublicKey,
    writer: Mutex<Option<File>>,
}

impl FileStorage {
    /// Open (creating if needed) the storage directory for a feed.
    pub fn open(dir: &Path, key: FeedPublicKey) -> Result<Self, FeedError> {
        std::fs::create_dir_all(dir).map_err(|e| FeedError::IoError(e.to_string()))?;

        if let Some(meta) = Self::read_meta(dir)? {
            if meta.key != key.to_hex() {
                return Err(FeedError::KeyError(format!(
                    "{} belongs to feed {}, not {}",
                    dir.display(),
                    meta.key,
                    key
                )));
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            key,
            writer: Mutex::new(None),
        })
    }

    /// Storage directory for a feed under a store root.
    pub fn feed_dir(root: &Path, key: &FeedPublicKey) -> PathBuf {
        root.join(key.to_hex())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read `meta.json` if it exists.
    pub fn read_meta(dir: &Path) -> Result<Option<FeedMeta>, FeedError> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| FeedError::IoError(e.to_string()))?;
        let meta = serde_json::from_slice(&data)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;
        Ok(Some(meta))
    }

    fn write_meta(&self, head: &FeedHead) -> Result<(), FeedError> {
        let meta = FeedMeta::new(&self.key, head);
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;
        // Write-then-rename so a crash never leaves half a meta file.
        let tmp = self.dir.join(format!("{}.tmp", META_FILE));
        std::fs::write(&tmp, json).map_err(|e| FeedError::IoError(e.to_string()))?;
        std::fs::rename(&tmp, self.dir.join(META_FILE))
            .map_err(|e| FeedError::IoError(e.to_string()))
    }

    fn open_log_for_append(&self) -> Result<File, FeedError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(ENTRIES_FILE))
            .map_err(|e| FeedError::IoError(e.to_string()))
    }
}

impl FeedStorage for FileStorage {
    fn append(&self, entry: &FeedEntry, head: &FeedHead) -> Result<(), FeedError> {
        let mut record = Vec::new();
        ciborium::into_writer(entry, &mut record)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;
        let len = u32::try_from(record.len())
            .map_err(|_| FeedError::SerializationError("entry record too large".to_string()))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?;
        if writer.is_none() {
            *writer = Some(self.open_log_for_append()?);
        }
        let Some(file) = writer.as_mut() else {
            return Err(FeedError::IoError("entry log not open".to_string()));
        };
        let start = file
            .metadata()
            .map_err(|e| FeedError::IoError(e.to_string()))?
            .len();

        let written = file
            .write_all(&len.to_be_bytes())
            .and_then(|_| file.write_all(&record))
            .and_then(|_| file.sync_data())
            .map_err(|e| FeedError::IoError(e.to_string()))
            .and_then(|_| self.write_meta(head));

        if let Err(e) = written {
            // Cut the log back so the index is not committed twice.
            if let Err(rollback) = file.set_len(start).and_then(|_| file.sync_data()) {
                log::error!(
                    "[feed {}] could not roll back entry {}: {}",
                    self.key.short(),
                    entry.index,
                    rollback
                );
                *writer = None;
            }
            return Err(e);
        }
        Ok(())
    }

    fn load(&self) -> Result<Vec<FeedEntry>, FeedError> {
        let path = self.dir.join(ENTRIES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| FeedError::IoError(e.to_string()))?;
        let file_len = file
            .metadata()
            .map_err(|e| FeedError::IoError(e.to_string()))?
            .len();
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut offset: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match read_full(&mut reader, &mut len_buf)? {
                ReadStatus::Eof => break,
                ReadStatus::Partial => {
                    log::warn!(
                        "[feed {}] discarding torn length prefix at record {}",
                        self.key.short(),
                        entries.len()
                    );
                    break;
                }
                ReadStatus::Full => {}
            }

            offset += len_buf.len() as u64;

            let record_len = u64::from(u32::from_be_bytes(len_buf));
            if record_len > file_len.saturating_sub(offset) {
                log::warn!(
                    "[feed {}] record {} claims {} bytes, only {} left; discarding",
                    self.key.short(),
                    entries.len(),
                    record_len,
                    file_len.saturating_sub(offset)
                );
                break;
            }
            let mut record = vec![0u8; record_len as usize];
            if !matches!(read_full(&mut reader, &mut record)?, ReadStatus::Full) {
                log::warn!(
                    "[feed {}] discarding torn record {}",
                    self.key.short(),
                    entries.len()
                );
                break;
            }
            offset += record_len;
            let entry: FeedEntry = ciborium::from_reader(record.as_slice())
                .map_err(|e| FeedError::SerializationError(e.to_string()))?;
            entries.push(entry);
        }

        if let Some(meta) = Self::read_meta(&self.dir)? {
            if meta.length != entries.len() as u64 {
                log::warn!(
                    "[feed {}] meta records {} entries, log holds {}",
                    self.key.short(),
                    meta.length,
                    entries.len()
                );
            }
        }

        Ok(entries)
    }

    fn truncate(&self) -> Result<(), FeedError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| FeedError::LockPoisoned(e.to_string()))?;
        *writer = None;
        File::create(self.dir.join(ENTRIES_FILE)).map_err(|e| FeedError::IoError(e.to_string()))?;
        drop(writer);
        self.write_meta(&FeedHead::empty())
    }
}

enum ReadStatus {
    Full,
    Partial,
    Eof,
}

/// Fill `buf` completely, distinguishing a clean EOF from a torn read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadStatus, FeedError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FeedError::IoError(e.to_string())),
        }
    }
    Ok(if filled == buf.len() {
        ReadStatus::Full
    } else if filled == 0 {
        ReadStatus::Eof
    } else {
        ReadStatus::Partial
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::entry::GENESIS_HASH;
    use crate::feed::keys::FeedKeypair;

    fn entry_chain(keypair: &FeedKeypair, payloads: &[&[u8]]) -> Vec<FeedEntry> {
        let mut prev = GENESIS_HASH;
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let entry = FeedEntry::new_signed(i as u64, prev, p.to_vec(), keypair);
                prev = entry.hash;
                entry
            })
            .collect()
    }

    fn head_after(entry: &FeedEntry) -> FeedHead {
        FeedHead {
            length: entry.index + 1,
            hash: entry.hash,
            root: [0u8; 32],
        }
    }

    #[test]
    fn test_file_storage_persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = FeedKeypair::generate();
        let entries = entry_chain(&keypair, &[b"one", b"two", b"three"]);

        {
            let storage = FileStorage::open(dir.path(), keypair.public_key()).unwrap();
            for entry in &entries {
                storage.append(entry, &head_after(entry)).unwrap();
            }
        }

        let storage = FileStorage::open(dir.path(), keypair.public_key()).unwrap();
        assert_eq!(storage.load().unwrap(), entries);

        let meta = FileStorage::read_meta(dir.path()).unwrap().unwrap();
        assert_eq!(meta.length, 3);
        assert_eq!(meta.key, keypair.public_key().to_hex());
    }

    #[test]
    fn test_torn_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = FeedKeypair::generate();
        let entries = entry_chain(&keypair, &[b"one", b"two"]);

        let storage = FileStorage::open(dir.path(), keypair.public_key()).unwrap();
        for entry in &entries {
            storage.append(entry, &head_after(entry)).unwrap();
        }

        // Simulate a crash halfway through the next record.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(ENTRIES_FILE))
            .unwrap();
        file.write_all(&100u32.to_be_bytes()).unwrap();
        file.write_all(&[0xAB; 10]).unwrap();

        let loaded = storage.load().unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_oversized_length_prefix_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = FeedKeypair::generate();
        let entries = entry_chain(&keypair, &[b"one"]);

        let storage = FileStorage::open(dir.path(), keypair.public_key()).unwrap();
        storage.append(&entries[0], &head_after(&entries[0])).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(ENTRIES_FILE))
            .unwrap();
        file.write_all(&u32::MAX.to_be_bytes()).unwrap();
        file.write_all(&[0xCD; 8]).unwrap();

        assert_eq!(storage.load().unwrap(), entries);
    }

    #[test]
    fn test_failed_meta_write_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = FeedKeypair::generate();
        let entries = entry_chain(&keypair, &[b"one", b"two"]);

        let storage = FileStorage::open(dir.path(), keypair.public_key()).unwrap();
        storage.append(&entries[0], &head_after(&entries[0])).unwrap();

        // A directory in place of meta.json makes the rename fail.
        let meta = dir.path().join(META_FILE);
        std::fs::remove_file(&meta).unwrap();
        std::fs::create_dir(&meta).unwrap();
        std::fs::write(meta.join("blocker"), b"x").unwrap();
        assert!(matches!(
            storage.append(&entries[1], &head_after(&entries[1])),
            Err(FeedError::IoError(_))
        ));
        std::fs::remove_dir_all(&meta).unwrap();
        assert_eq!(storage.load().unwrap(), entries[..1].to_vec());

        storage.append(&entries[1], &head_after(&entries[1])).unwrap();
        assert_eq!(storage.load().unwrap(), entries);
    }

    #[test]
    fn test_open_rejects_other_feed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let owner = FeedKeypair::generate();
        let entries = entry_chain(&owner, &[b"one"]);

        let storage = FileStorage::open(dir.path(), owner.public_key()).unwrap();
        storage.append(&entries[0], &head_after(&entries[0])).unwrap();

        let stranger = FeedKeypair::generate();
        let result = FileStorage::open(dir.path(), stranger.public_key());
        assert!(matches!(result, Err(FeedError::KeyError(_))));
    }

    #[test]
    fn test_truncate_clears_log() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = FeedKeypair::generate();
        let entries = entry_chain(&keypair, &[b"one", b"two"]);

        let storage = FileStorage::open(dir.path(), keypair.public_key()).unwrap();
        for entry in &entries {
            storage.append(entry, &head_after(entry)).unwrap();
        }
        storage.truncate().unwrap();
        assert!(storage.load().unwrap().is_empty());

        // Appending after a truncate starts a fresh log.
        storage.append(&entries[0], &head_after(&entries[0])).unwrap();
        assert_eq!(storage.load().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_storage() {
        let keypair = FeedKeypair::generate();
        let entries = entry_chain(&keypair, &[b"x"]);
        let storage = MemoryStorage::new();
        storage.append(&entries[0], &head_after(&entries[0])).unwrap();
        assert_eq!(storage.load().unwrap(), entries);
        storage.truncate().unwrap();
        assert!(storage.load().unwrap().is_empty());
    }
}
