//! Bounded LRU cache of open table readers.
//!
//! Hot files are read repeatedly by point lookups; keeping the handle open
//! avoids an `open` per lookup. Readers are rewound before every use.

use std::{
    fs::File,
    io::{BufReader, Seek},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use lru::LruCache;
use tracing::trace;

use super::SstError;

type SharedReader = Arc<Mutex<BufReader<File>>>;

pub struct FdCache {
    cache: Mutex<LruCache<PathBuf, SharedReader>>,
}

impl FdCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn handle(&self, path: &Path) -> Result<SharedReader, SstError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| SstError::Internal("fd cache lock poisoned".into()))?;

        if let Some(reader) = cache.get(path) {
            trace!(path = %path.display(), "fd cache hit");
            return Ok(Arc::clone(reader));
        }

        let reader = Arc::new(Mutex::new(BufReader::new(File::open(path)?)));
        // `put` evicts the least recently used handle when full.
        cache.put(path.to_path_buf(), Arc::clone(&reader));
        trace!(path = %path.display(), "fd cache miss");
        Ok(reader)
    }

    /// Runs `f` with a reader positioned at the start of `path`, opening and
    /// caching the file on first use.
    pub fn with_reader<R, F>(&self, path: &Path, f: F) -> Result<R, SstError>
    where
        F: FnOnce(&mut BufReader<File>) -> Result<R, SstError>,
    {
        let handle = self.handle(path)?;
        let mut reader = handle
            .lock()
            .map_err(|_| SstError::Internal("reader lock poisoned".into()))?;
        reader.rewind()?;
        f(&mut reader)
    }

    /// Drops the cached handle for `path`, if any.
    pub fn evict(&self, path: &Path) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(path);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
