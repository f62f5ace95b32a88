use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::index::{FileEntry, FileId, FileIndex, FilesIndex, StorageId};
use crate::mapping::{FileMapping, FileView, OpenFileError, OpenUnmapLock};
use crate::mode::OpenMode;
use crate::opening::OpeningFiles;

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
/// Configuration options for the file view pool.
pub struct PoolConfig {
    /// The number of file mappings the pool may keep cached at once.
    ///
    /// Views handed out to callers keep their mapping alive independently of
    /// the cache, so the number of live mappings can momentarily exceed this.
    pub size_limit: usize,
    /// The size in bytes of one page as reported to
    /// [FileViewPool::record_file_write].
    pub page_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_limit: 40,
            page_size: 4096,
        }
    }
}

#[derive(Debug, Clone)]
/// A snapshot of one cached file handle, see [FileViewPool::get_status].
pub struct OpenFileState {
    /// The index of the file within its storage.
    pub file_index: FileIndex,
    /// The mode the cached handle is open in.
    pub open_mode: OpenMode,
    /// When the handle last served a request.
    pub last_use: Instant,
}

/// A bounded cache of open, memory mapped file handles.
///
/// Worker threads ask the pool for a [FileView] of a `(storage, file)` pair
/// and the pool keeps the most recently used mappings open, evicting the
/// least recently used handle whenever a fresh open pushes the cache over
/// its limit. Threads racing to open the same absent file perform a single
/// OS open and share its outcome, including failure.
///
/// Views carry shared ownership of their mapping, eviction never invalidates
/// a view a caller still holds.
pub struct FileViewPool {
    state: Mutex<PoolState>,
    page_size: u64,
    open_unmap_lock: OpenUnmapLock,
    #[cfg(test)]
    pub(crate) mapping_creates: std::sync::atomic::AtomicUsize,
}

struct PoolState {
    size_limit: usize,
    files: FilesIndex,
    opening: OpeningFiles,
}

impl FileViewPool {
    /// Create a pool with no open/unmap serialization.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_unmap_lock(config, OpenUnmapLock::noop())
    }

    /// Create a pool whose mapping opens and unmaps both hold
    /// `open_unmap_lock`, for platforms whose file mapping API cannot run
    /// the two concurrently.
    pub fn with_unmap_lock(config: PoolConfig, open_unmap_lock: OpenUnmapLock) -> Self {
        Self {
            state: Mutex::new(PoolState {
                size_limit: config.size_limit,
                files: FilesIndex::new(),
                opening: OpeningFiles::default(),
            }),
            page_size: config.page_size,
            open_unmap_lock,
            #[cfg(test)]
            mapping_creates: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Return a view of file `file_index` in `storage`, opening and mapping
    /// `path` if the pool does not already hold a usable handle.
    ///
    /// `file_size` is the logical size of the file in bytes, writable files
    /// are grown to it on open. A cached read-only handle cannot serve a
    /// write request and is re-opened in the wider mode.
    pub fn open_file(
        &self,
        storage: StorageId,
        file_index: FileIndex,
        path: &Path,
        file_size: u64,
        mode: OpenMode,
    ) -> Result<FileView, OpenFileError> {
        let key = FileId {
            storage,
            file: file_index,
        };

        let mut state = self.state.lock();

        let mut stale = None;
        match state.files.mode_of(key) {
            Some(cached) if cached.covers(mode) => {
                let mapping = state
                    .files
                    .touch(key, Instant::now())
                    .expect("entry was found under the same lock");
                return Ok(FileView::new(mapping));
            }
            Some(_) => {
                // Outstanding views keep the narrow mapping alive, it is
                // only dropped from the cache (outside the lock, below).
                stale = state.files.remove(key).map(|entry| entry.mapping);
            }
            None => {}
        }

        if let Some(waiter) = state.opening.join(key, mode) {
            loop {
                if let Some(result) = waiter.try_take() {
                    drop(state);
                    drop(stale);
                    return result.map(FileView::new);
                }
                waiter.unblock.wait(&mut state);
            }
        }

        state.opening.begin(key, mode);
        drop(state);

        // The OS open and mmap run without the pool lock held, late arrivals
        // for the same file queue up as waiters meanwhile.
        #[cfg(test)]
        self.mapping_creates
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let result = FileMapping::create(path, file_size, mode, &self.open_unmap_lock)
            .map(Arc::new);
        drop(stale);

        let mut state = self.state.lock();
        let waiters = state.opening.complete(key, mode);

        let mut displaced = None;
        let mut evicted = None;
        if let Ok(mapping) = &result {
            displaced = state.files.insert(FileEntry {
                key,
                mapping: mapping.clone(),
                last_use: Instant::now(),
                mode,
                dirty_bytes: 0,
            });
            if state.files.len() > state.size_limit {
                evicted = state.files.pop_oldest();
                if let Some(entry) = &evicted {
                    tracing::debug!(key = ?entry.key, "evicting least recently used file");
                }
            }
        }

        // Results are assigned before the waiters are signalled, and while
        // the lock their condvars are bound to is still held.
        for waiter in waiters {
            waiter.fill(result.clone());
            waiter.unblock.notify_one();
        }
        drop(state);

        drop(displaced);
        drop(evicted);

        result.map(FileView::new)
    }

    /// Drop every cached handle in the pool.
    ///
    /// In-flight opens are unaffected, they complete, notify their waiters
    /// and re-enter the cache.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        let removed = state.files.drain_all();
        drop(state);
        // Mappings unmap outside the lock, views still holding one keep it
        // alive until they drop.
        drop(removed);
    }

    /// Drop every cached handle belonging to `storage`.
    pub fn release_storage(&self, storage: StorageId) {
        let mut state = self.state.lock();
        let removed = state.files.remove_storage(storage);
        drop(state);

        if !removed.is_empty() {
            tracing::debug!(
                storage = ?storage,
                num_files = removed.len(),
                "released storage files"
            );
        }
        drop(removed);
    }

    /// Drop the cached handle of one file, if present.
    pub fn release_file(&self, storage: StorageId, file_index: FileIndex) {
        let key = FileId {
            storage,
            file: file_index,
        };
        let mut state = self.state.lock();
        let removed = state.files.remove(key);
        drop(state);
        drop(removed);
    }

    /// Update the number of handles the pool may cache, evicting least
    /// recently used entries until the new limit holds.
    pub fn resize(&self, size_limit: usize) {
        let mut state = self.state.lock();
        state.size_limit = size_limit;

        let mut evicted = Vec::new();
        while state.files.len() > state.size_limit {
            match state.files.pop_oldest() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        drop(state);
        drop(evicted);
    }

    /// The current limit on cached handles.
    pub fn size_limit(&self) -> usize {
        self.state.lock().size_limit
    }

    /// Drop the least recently used cached handle, if any.
    pub fn close_oldest(&self) {
        let mut state = self.state.lock();
        let removed = state.files.pop_oldest();
        drop(state);
        // The unmap happens here, after the lock is released.
        drop(removed);
    }

    /// Snapshot the cached handles belonging to `storage`.
    pub fn get_status(&self, storage: StorageId) -> Vec<OpenFileState> {
        let state = self.state.lock();
        state
            .files
            .iter()
            .filter(|entry| entry.key.storage == storage)
            .map(|entry| OpenFileState {
                file_index: entry.key.file,
                open_mode: entry.mode,
                last_use: entry.last_use,
            })
            .collect()
    }

    /// Record `pages` pages worth of completed writes against a cached file,
    /// feeding the dirtiest-first ordering of
    /// [FileViewPool::flush_next_file]. No-op if the file is not cached.
    pub fn record_file_write(
        &self,
        storage: StorageId,
        file_index: FileIndex,
        pages: u64,
    ) {
        let key = FileId {
            storage,
            file: file_index,
        };
        let mut state = self.state.lock();
        state.files.add_dirty(key, pages * self.page_size);
    }

    /// Flush the cached file with the most dirty bytes back to disk.
    ///
    /// Returns `Ok(())` when no file is dirty. On failure the dirty counter
    /// is left untouched so the file stays eligible for a retry.
    pub fn flush_next_file(&self) -> io::Result<()> {
        let state = self.state.lock();
        let Some((key, mapping, dirty_bytes)) = state.files.max_dirty() else {
            return Ok(());
        };
        drop(state);

        tracing::trace!(key = ?key, dirty_bytes = dirty_bytes, "flushing dirtiest file");
        if let Err(error) = mapping.flush(0, mapping.len()) {
            tracing::error!(error = %error, key = ?key, "failed to flush file");
            return Err(error);
        }

        let mut state = self.state.lock();
        // The entry may have been evicted, or evicted and re-opened, while
        // the flush ran. Its counter is only reset when the flushed mapping
        // is still the cached one.
        state.files.reset_dirty(key, &mapping);
        Ok(())
    }
}

impl Default for FileViewPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
impl FileViewPool {
    pub(crate) fn cached_file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    pub(crate) fn cached_mode(
        &self,
        storage: StorageId,
        file_index: FileIndex,
    ) -> Option<OpenMode> {
        let key = FileId {
            storage,
            file: file_index,
        };
        self.state.lock().files.mode_of(key)
    }

    pub(crate) fn cached_dirty_bytes(
        &self,
        storage: StorageId,
        file_index: FileIndex,
    ) -> Option<u64> {
        let key = FileId {
            storage,
            file: file_index,
        };
        self.state
            .lock()
            .files
            .get(key)
            .map(|entry| entry.dirty_bytes)
    }

    pub(crate) fn cached_keys_by_age(&self) -> Vec<FileId> {
        self.state.lock().files.keys_by_age()
    }

    pub(crate) fn opening_count(&self) -> usize {
        self.state.lock().opening.len()
    }
}
