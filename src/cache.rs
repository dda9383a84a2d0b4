//! Server file cache with LRU eviction
//!
//! Sits between the request handlers and the storage root. The filesystem is
//! the system of record: lookups read through on a miss, and stores write to
//! disk synchronously before invalidating the cached copy.
//!
//! # Thread Safety
//!
//! The LRU index lives behind a `parking_lot::Mutex` that is never held across
//! an `.await`. Reads and writes of the same filename are serialised by a
//! per-filename `RwLock`: a lookup holds the read side from cache check to
//! insert, a store holds the write side from temp write to invalidation, so a
//! stale read can never be inserted after a newer store.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::error::{Error, Result};

/// Default number of cached files
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Cached file content
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content: Arc<Vec<u8>>,
    pub size: u32,
}

impl CacheEntry {
    fn new(content: Arc<Vec<u8>>) -> Result<Self> {
        let size = u32::try_from(content.len()).map_err(|_| {
            Error::Storage(format!("file of {} bytes is too large to serve", content.len()))
        })?;
        Ok(Self { content, size })
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

/// Per-filename reader/writer exclusion
#[derive(Default)]
struct FileLocks {
    table: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl FileLocks {
    fn lock_for(&self, filename: &str) -> Arc<RwLock<()>> {
        let mut table = self.table.lock();
        // Entries only the table still references are idle
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
        table
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    async fn read(&self, filename: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(filename).read_owned().await
    }

    async fn write(&self, filename: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(filename).write_owned().await
    }
}

/// Bounded read-through cache over a storage root
pub struct FileCache {
    root: PathBuf,
    /// `None` when caching is disabled
    entries: Option<Mutex<LruCache<String, CacheEntry>>>,
    locks: FileLocks,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FileCache {
    /// Create a cache over `root` holding at most `capacity` files (0 disables caching)
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            locks: FileLocks::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .as_ref()
            .map(|entries| entries.lock().cap().get())
            .unwrap_or(0)
    }

    /// Fetch a file, from memory when cached, otherwise from disk.
    ///
    /// `filename` must already be validated.
    pub async fn lookup(&self, filename: &str) -> Result<CacheEntry> {
        let _guard = self.locks.read(filename).await;

        if let Some(entry) = self.cached(filename) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit: {}", filename);
            return Ok(entry);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let path = self.root.join(filename);
        let metadata = fs::metadata(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::Storage(format!("file not found: {}", filename)),
            _ => Error::storage(&format!("cannot stat {}", filename), e),
        })?;
        if !metadata.is_file() {
            return Err(Error::Storage(format!("not a regular file: {}", filename)));
        }

        let content = fs::read(&path)
            .await
            .map_err(|e| Error::storage(&format!("cannot read {}", filename), e))?;
        let entry = CacheEntry::new(Arc::new(content))?;

        self.insert(filename, entry.clone());
        debug!("Cache miss: {} ({} bytes read)", filename, entry.size);
        Ok(entry)
    }

    /// Write a file to disk and drop any cached copy before returning.
    ///
    /// The content goes to a hidden `.part` file first and is renamed into
    /// place once synced, so an interrupted store never replaces the
    /// committed file.
    pub async fn store(&self, filename: &str, content: &[u8]) -> Result<()> {
        let _guard = self.locks.write(filename).await;

        let path = self.root.join(filename);
        let parent = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        let name = path
            .file_name()
            .ok_or_else(|| Error::Storage(format!("no file name in {}", filename)))?
            .to_string_lossy()
            .into_owned();
        let temp_path = parent.join(format!(".{}.part", name));

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::storage("cannot create directory", e))?;

        if let Err(e) = write_synced(&temp_path, content).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::storage(&format!("cannot write {}", filename), e));
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::storage(&format!("cannot commit {}", filename), e));
        }

        self.invalidate(filename);
        Ok(())
    }

    /// Insert or replace an entry, evicting the least recently used one at capacity
    pub fn insert(&self, filename: &str, entry: CacheEntry) {
        if let Some(entries) = &self.entries {
            if let Some((evicted, _)) = entries.lock().push(filename.to_string(), entry) {
                if evicted != filename {
                    debug!("Cache evicted: {}", evicted);
                }
            }
        }
    }

    /// Cached entry for `filename`, marking it most recently used
    pub fn cached(&self, filename: &str) -> Option<CacheEntry> {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().get(filename).cloned())
    }

    /// Whether `filename` is cached, without touching its recency
    pub fn contains(&self, filename: &str) -> bool {
        self.entries
            .as_ref()
            .map(|entries| entries.lock().contains(filename))
            .unwrap_or(false)
    }

    pub fn invalidate(&self, filename: &str) {
        if let Some(entries) = &self.entries {
            if entries.lock().pop(filename).is_some() {
                debug!("Cache invalidated: {}", filename);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self
                .entries
                .as_ref()
                .map(|entries| entries.lock().len())
                .unwrap_or(0),
        }
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}
