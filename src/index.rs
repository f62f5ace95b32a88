use std::collections::BTreeSet;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::hash_table::{self, HashTable};

use crate::mapping::FileMapping;
use crate::mode::OpenMode;

/// Identifies one storage, a grouped set of files, attached to the pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StorageId(pub u32);

/// The index of a file within its storage.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FileIndex(pub u32);

/// Uniquely names one file across every storage attached to the pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FileId {
    pub storage: StorageId,
    pub file: FileIndex,
}

/// One cached file handle.
pub(crate) struct FileEntry {
    pub key: FileId,
    pub mapping: Arc<FileMapping>,
    pub last_use: Instant,
    pub mode: OpenMode,
    /// Bytes written through the mapping since its last successful flush.
    pub dirty_bytes: u64,
}

/// The container of cached file handles, indexed three ways.
///
/// Entries live in a slab arena and are referenced by slot from two side
/// indexes kept in lockstep, a hash lookup by [FileId] and an intrusive
/// doubly linked recency list (head is most recently used). Entries with
/// dirty bytes are additionally tracked in an ordered set so the dirtiest
/// file can be selected for flushing.
pub(crate) struct FilesIndex {
    hasher: foldhash::fast::RandomState,
    lookup: HashTable<u32>,
    entries: slab::Slab<Node>,
    first_node: u32,
    last_node: u32,
    dirty: BTreeSet<(u64, u32)>,
}

struct Node {
    entry: FileEntry,
    next_node: u32,
    prev_node: u32,
}

impl FilesIndex {
    pub(crate) fn new() -> Self {
        Self {
            hasher: foldhash::fast::RandomState::default(),
            lookup: HashTable::new(),
            entries: slab::Slab::new(),
            first_node: u32::MAX,
            last_node: u32::MAX,
            dirty: BTreeSet::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The open mode of the cached handle for `key`, if any.
    pub(crate) fn mode_of(&self, key: FileId) -> Option<OpenMode> {
        self.get(key).map(|entry| entry.mode)
    }

    pub(crate) fn get(&self, key: FileId) -> Option<&FileEntry> {
        let slot = self.find_slot(key)?;
        Some(&self.entries[slot as usize].entry)
    }

    /// Refresh the recency of `key` and return its shared mapping.
    pub(crate) fn touch(
        &mut self,
        key: FileId,
        now: Instant,
    ) -> Option<Arc<FileMapping>> {
        let slot = self.find_slot(key)?;
        let node = &mut self.entries[slot as usize];
        node.entry.last_use = now;
        let mapping = node.entry.mapping.clone();
        self.move_to_front(slot);
        Some(mapping)
    }

    /// Insert a fresh entry at the most recently used end.
    ///
    /// If the key is already present, the previous entry is displaced and
    /// returned so the caller can drop its mapping outside the pool lock.
    pub(crate) fn insert(&mut self, entry: FileEntry) -> Option<FileEntry> {
        let displaced = self.remove(entry.key);

        let key = entry.key;
        debug_assert_eq!(entry.dirty_bytes, 0, "fresh entries start clean");
        let slot = self.entries.insert(Node {
            entry,
            next_node: u32::MAX,
            prev_node: u32::MAX,
        }) as u32;

        let hash_key = self.hasher.hash_one(key);
        let hasher = |idx: &u32| {
            self.hasher
                .hash_one(self.entries[*idx as usize].entry.key)
        };
        self.lookup.insert_unique(hash_key, slot, hasher);
        self.push_front(slot);

        displaced
    }

    /// Remove the entry for `key`, unlinking it from every index.
    pub(crate) fn remove(&mut self, key: FileId) -> Option<FileEntry> {
        let hash_key = self.hasher.hash_one(key);
        let eq_check = |idx: &u32| self.entries[*idx as usize].entry.key == key;
        let hasher = |idx: &u32| {
            self.hasher
                .hash_one(self.entries[*idx as usize].entry.key)
        };

        let maybe_occupied = self.lookup.entry(hash_key, eq_check, hasher);
        let slot = match maybe_occupied {
            hash_table::Entry::Occupied(entry) => entry.remove().0,
            hash_table::Entry::Vacant(_) => return None,
        };

        self.unlink_node(slot);
        let node = self.entries.remove(slot as usize);
        if node.entry.dirty_bytes > 0 {
            self.dirty.remove(&(node.entry.dirty_bytes, slot));
        }
        Some(node.entry)
    }

    /// Remove and return the least recently used entry, if any.
    ///
    /// Ties on `last_use` resolve to the entry touched least recently in
    /// sequence order, the list itself is the tiebreak.
    pub(crate) fn pop_oldest(&mut self) -> Option<FileEntry> {
        if self.last_node == u32::MAX {
            return None;
        }
        let key = self.entries[self.last_node as usize].entry.key;
        self.remove(key)
    }

    /// Remove every entry belonging to `storage`.
    pub(crate) fn remove_storage(&mut self, storage: StorageId) -> Vec<FileEntry> {
        let keys: Vec<FileId> = self
            .entries
            .iter()
            .map(|(_, node)| node.entry.key)
            .filter(|key| key.storage == storage)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }

    /// Remove every entry in the index.
    pub(crate) fn drain_all(&mut self) -> Vec<FileEntry> {
        let keys: Vec<FileId> = self
            .entries
            .iter()
            .map(|(_, node)| node.entry.key)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }

    /// Add `bytes` to the dirty counter of `key` and rebalance the dirty
    /// index. No-op if the key is not cached.
    pub(crate) fn add_dirty(&mut self, key: FileId, bytes: u64) {
        let Some(slot) = self.find_slot(key) else {
            return;
        };

        let entry = &mut self.entries[slot as usize].entry;
        let old = entry.dirty_bytes;
        entry.dirty_bytes += bytes;
        let new = entry.dirty_bytes;

        if old > 0 {
            self.dirty.remove(&(old, slot));
        }
        if new > 0 {
            self.dirty.insert((new, slot));
        }
    }

    /// The cached entry with the most dirty bytes, if any entry is dirty.
    pub(crate) fn max_dirty(&self) -> Option<(FileId, Arc<FileMapping>, u64)> {
        let &(dirty_bytes, slot) = self.dirty.last()?;
        let entry = &self.entries[slot as usize].entry;
        Some((entry.key, entry.mapping.clone(), dirty_bytes))
    }

    /// Zero the dirty counter of `key` after a completed flush.
    ///
    /// Skipped when the entry was evicted, or evicted and replaced, while
    /// the flush ran without the lock held, `mapping` identifies the exact
    /// handle the flush targeted.
    pub(crate) fn reset_dirty(&mut self, key: FileId, mapping: &Arc<FileMapping>) {
        let Some(slot) = self.find_slot(key) else {
            return;
        };

        let entry = &mut self.entries[slot as usize].entry;
        if !Arc::ptr_eq(&entry.mapping, mapping) {
            return;
        }

        let old = entry.dirty_bytes;
        entry.dirty_bytes = 0;
        if old > 0 {
            self.dirty.remove(&(old, slot));
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FileEntry> + '_ {
        self.entries.iter().map(|(_, node)| &node.entry)
    }

    #[cfg(test)]
    /// Keys ordered least recently used first.
    pub(crate) fn keys_by_age(&self) -> Vec<FileId> {
        let mut keys = Vec::with_capacity(self.entries.len());
        let mut cursor = self.last_node;
        while cursor != u32::MAX {
            let node = &self.entries[cursor as usize];
            keys.push(node.entry.key);
            cursor = node.prev_node;
        }
        keys
    }

    fn find_slot(&self, key: FileId) -> Option<u32> {
        let hash_key = self.hasher.hash_one(key);
        self.lookup
            .find(hash_key, |idx| {
                self.entries[*idx as usize].entry.key == key
            })
            .copied()
    }

    fn move_to_front(&mut self, idx: u32) {
        if idx == self.first_node {
            return;
        }
        self.unlink_node(idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: u32) {
        let node = &mut self.entries[idx as usize];
        node.prev_node = u32::MAX;
        node.next_node = self.first_node;

        if self.first_node != u32::MAX {
            self.entries[self.first_node as usize].prev_node = idx;
        }
        self.first_node = idx;

        if self.last_node == u32::MAX {
            self.last_node = idx;
        }
    }

    fn unlink_node(&mut self, idx: u32) {
        let node = &self.entries[idx as usize];
        let (prev, next) = (node.prev_node, node.next_node);

        if prev != u32::MAX {
            self.entries[prev as usize].next_node = next;
        } else {
            self.first_node = next;
        }

        if next != u32::MAX {
            self.entries[next as usize].prev_node = prev;
        } else {
            self.last_node = prev;
        }
    }
}
