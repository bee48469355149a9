//! In-memory write buffer over the skip list.
//!
//! The memtable is the mutable first level of the store. It tracks an
//! approximate byte size (the sum of key and value lengths) so the engine
//! knows when to rotate it out and flush it to a segment. Deletes are
//! recorded as tombstones (`None` values), which mask older versions of the
//! key in segments below.
//!
//! Interior mutability follows the single-writer/multi-reader model: the
//! skip list sits behind an `RwLock` and the size counter is atomic, so
//! readers never block each other. Memtable operations never fail.

use crate::skiplist::SkipList;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

pub struct Memtable {
    list: RwLock<SkipList>,
    /// Approximate size in bytes, for the flush trigger.
    size: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            list: RwLock::new(SkipList::new()),
            size: AtomicUsize::new(0),
        }
    }

    /// Looks up `key`. The outer `Option` distinguishes an absent key from a
    /// present tombstone (`Some(None)`).
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.list.read().unwrap().get(key).cloned()
    }

    /// Inserts or replaces `key`. A `None` value records a tombstone.
    ///
    /// Size accounting: a fresh insert adds `len(key) + len(value)`, a
    /// replacement adds only the value-length delta. Tombstones count their
    /// key bytes.
    pub fn put(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let key_len = key.len();
        let value_len = value.as_ref().map_or(0, |v| v.len());

        let mut list = self.list.write().unwrap();
        match list.insert(key, value) {
            Some(old) => {
                let old_len = old.as_ref().map_or(0, |v| v.len());
                if value_len >= old_len {
                    self.size.fetch_add(value_len - old_len, Ordering::Relaxed);
                } else {
                    self.size.fetch_sub(old_len - value_len, Ordering::Relaxed);
                }
            }
            None => {
                self.size.fetch_add(key_len + value_len, Ordering::Relaxed);
            }
        }
    }

    /// Approximate size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.list.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered snapshot of the entries with keys in `[start, limit)`.
    /// Tombstones are included so the merge layer can resolve newest-wins
    /// before discarding them.
    pub fn scan(&self, start: &[u8], limit: &[u8]) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let list = self.list.read().unwrap();
        list.iter_from(start)
            .take_while(|(key, _)| *key < limit)
            .map(|(key, value)| (key.to_vec(), value.clone()))
            .collect()
    }

    /// Ordered snapshot of every entry, for the flush path.
    pub fn entries(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let list = self.list.read().unwrap();
        list.iter()
            .map(|(key, value)| (key.to_vec(), value.clone()))
            .collect()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
