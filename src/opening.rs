use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::index::FileId;
use crate::mapping::{FileMapping, OpenFileError};
use crate::mode::OpenMode;

pub(crate) type OpenResult = Result<Arc<FileMapping>, OpenFileError>;

type WaiterList = SmallVec<[Arc<OpenWaiter>; 2]>;

/// One thread waiting on another thread's in-flight open of the same file.
///
/// The opener hands the mapping (or error) straight through the slot rather
/// than having the waiter re-query the cache, so the waiter still receives a
/// valid mapping even when the entry was evicted before it woke up.
pub(crate) struct OpenWaiter {
    /// Signalled by the opener once the slot is populated. Waits on the
    /// pool's primary mutex.
    pub(crate) unblock: Condvar,
    slot: Mutex<Option<OpenResult>>,
}

impl OpenWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            unblock: Condvar::new(),
            slot: Mutex::new(None),
        })
    }

    /// Take the delivered open result, or `None` on a spurious wake up.
    ///
    /// Must only be called while holding the pool's primary mutex.
    pub(crate) fn try_take(&self) -> Option<OpenResult> {
        self.slot.lock().take()
    }

    /// Deliver the open result, called before notifying the waiter.
    ///
    /// Must only be called while holding the pool's primary mutex.
    pub(crate) fn fill(&self, result: OpenResult) {
        *self.slot.lock() = Some(result);
    }
}

/// A file some thread is currently opening, plus everyone waiting on it.
struct OpeningFile {
    key: FileId,
    /// The mode the open was started with. A thread needing write access
    /// must not wait on a read-only open.
    mode: OpenMode,
    waiters: WaiterList,
}

/// The set of files currently being opened outside the primary lock.
///
/// Lookup is linear, the number of in-flight opens is bounded by the IO
/// worker thread count.
#[derive(Default)]
pub(crate) struct OpeningFiles {
    entries: SmallVec<[OpeningFile; 4]>,
}

impl OpeningFiles {
    /// Attach a waiter to an in-flight open of `key` whose mode covers
    /// `mode`, if one exists.
    pub(crate) fn join(&mut self, key: FileId, mode: OpenMode) -> Option<Arc<OpenWaiter>> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.key == key && entry.mode.covers(mode))?;

        let waiter = OpenWaiter::new();
        entry.waiters.push(waiter.clone());
        Some(waiter)
    }

    /// Register `key` as being opened in `mode`.
    pub(crate) fn begin(&mut self, key: FileId, mode: OpenMode) {
        debug_assert!(
            !self
                .entries
                .iter()
                .any(|entry| entry.key == key && entry.mode == mode),
            "one opener per (key, mode) at a time",
        );
        self.entries.push(OpeningFile {
            key,
            mode,
            waiters: WaiterList::new(),
        });
    }

    /// Remove the `(key, mode)` opening entry and hand back its waiters.
    pub(crate) fn complete(&mut self, key: FileId, mode: OpenMode) -> WaiterList {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.key == key && entry.mode == mode)
            .expect("opening entry is owned by its opener until completion");
        self.entries.swap_remove(position).waiters
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
