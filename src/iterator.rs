//! K-way merge across the memtable and segment cursors.
//!
//! Range scans see several sorted sources at once: the live memtable, the
//! frozen memtable while a flush is running, and every segment. The merge
//! presents them as one ordered stream with newest-wins resolution.
//!
//! A min-heap holds the current head of each source. Sources are numbered
//! in freshness order (0 is newest), and the heap breaks key ties in favor
//! of the lower source index, so the newest version of a key always pops
//! first. Older versions of an already-resolved key are consumed and
//! discarded as their sources advance past it.
//!
//! Tombstones take part in the resolution and are then suppressed: when the
//! winning version of a key is a tombstone, the key is not emitted at all.
//! Emitted keys are strictly increasing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;

/// A source cursor: ordered `(key, value)` pairs where a `None` value is a
/// tombstone. Sources are already bounded to the scanned range.
pub type SourceIter = Box<dyn Iterator<Item = Result<(Vec<u8>, Option<Vec<u8>>)>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    source_index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source_index == other.source_index
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; on equal keys the smaller source
        // index (the newer source) must pop first.
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.source_index.cmp(&other.source_index).reverse(),
            other => other.reverse(),
        }
    }
}

/// Merging iterator over a range scan. Yields `(key, value)` pairs in
/// strictly ascending key order with tombstoned keys removed.
pub struct ScanIterator {
    sources: Vec<SourceIter>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    /// A source failure held back until the entries read before it have
    /// been yielded. The iterator ends after reporting it.
    pending_error: Option<crate::error::Error>,
    failed: bool,
}

impl ScanIterator {
    /// Builds the merge over `sources`, which must be listed newest first.
    pub fn new(mut sources: Vec<SourceIter>) -> Result<Self> {
        let mut heap = BinaryHeap::new();

        // Prime the heap with the head of each source; sources empty in the
        // range drop out immediately
        for (source_index, source) in sources.iter_mut().enumerate() {
            match source.next() {
                Some(Ok((key, value))) => heap.push(HeapEntry {
                    key,
                    value,
                    source_index,
                }),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }

        Ok(Self {
            sources,
            heap,
            last_key: None,
            pending_error: None,
            failed: false,
        })
    }

    fn advance(&mut self, source_index: usize) -> Result<()> {
        match self.sources[source_index].next() {
            Some(Ok((key, value))) => {
                self.heap.push(HeapEntry {
                    key,
                    value,
                    source_index,
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for ScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        while let Some(entry) = self.heap.pop() {
            // Keep the source flowing. On failure the current entry is still
            // the correct minimum; it is yielded now and the error reported
            // on the next call, after which the iterator is exhausted.
            if let Err(e) = self.advance(entry.source_index) {
                self.pending_error = Some(e);
            }

            // An older version of a key that already resolved
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                if self.pending_error.is_some() {
                    break;
                }
                continue;
            }
            self.last_key = Some(entry.key.clone());

            match entry.value {
                Some(value) => return Some(Ok((entry.key, value))),
                // The newest version is a tombstone: the key does not exist
                None => {
                    if self.pending_error.is_some() {
                        break;
                    }
                    continue;
                }
            }
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn source(entries: Vec<(&[u8], Option<&[u8]>)>) -> SourceIter {
        let owned: Vec<Result<(Vec<u8>, Option<Vec<u8>>)>> = entries
            .into_iter()
            .map(|(k, v)| Ok((k.to_vec(), v.map(|v| v.to_vec()))))
            .collect();
        Box::new(owned.into_iter())
    }

    fn collect(iter: ScanIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        iter.collect::<Result<Vec<_>>>().expect("merge failed")
    }

    #[test]
    fn test_merges_disjoint_sources_in_order() {
        let iter = ScanIterator::new(vec![
            source(vec![(b"b", Some(b"2")), (b"d", Some(b"4"))]),
            source(vec![(b"a", Some(b"1")), (b"c", Some(b"3"))]),
        ])
        .expect("Failed to build iterator");

        let keys: Vec<_> = collect(iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_newest_source_wins_ties() {
        let iter = ScanIterator::new(vec![
            source(vec![(b"k", Some(b"new"))]),
            source(vec![(b"k", Some(b"old"))]),
        ])
        .expect("Failed to build iterator");

        assert_eq!(collect(iter), vec![(b"k".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_older_duplicates_are_consumed() {
        // The same key in three sources: only the newest value appears, once
        let iter = ScanIterator::new(vec![
            source(vec![(b"k", Some(b"v0")), (b"z", Some(b"zz"))]),
            source(vec![(b"k", Some(b"v1"))]),
            source(vec![(b"k", Some(b"v2"))]),
        ])
        .expect("Failed to build iterator");

        assert_eq!(
            collect(iter),
            vec![
                (b"k".to_vec(), b"v0".to_vec()),
                (b"z".to_vec(), b"zz".to_vec()),
            ]
        );
    }

    #[test]
    fn test_winning_tombstone_suppresses_key() {
        let iter = ScanIterator::new(vec![
            source(vec![(b"b", None)]),
            source(vec![(b"a", Some(b"1")), (b"b", Some(b"stale")), (b"c", Some(b"3"))]),
        ])
        .expect("Failed to build iterator");

        assert_eq!(
            collect(iter),
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_older_tombstone_loses_to_newer_put() {
        let iter = ScanIterator::new(vec![
            source(vec![(b"k", Some(b"back"))]),
            source(vec![(b"k", None)]),
        ])
        .expect("Failed to build iterator");

        assert_eq!(collect(iter), vec![(b"k".to_vec(), b"back".to_vec())]);
    }

    #[test]
    fn test_all_tombstones_exhausts_cleanly() {
        let iter = ScanIterator::new(vec![source(vec![(b"a", None), (b"b", None)])])
            .expect("Failed to build iterator");
        assert!(collect(iter).is_empty());
    }

    #[test]
    fn test_empty_sources() {
        let iter = ScanIterator::new(vec![source(vec![]), source(vec![])])
            .expect("Failed to build iterator");
        assert!(collect(iter).is_empty());
    }

    #[test]
    fn test_keys_strictly_increasing() {
        let iter = ScanIterator::new(vec![
            source(vec![(b"a", Some(b"x")), (b"c", Some(b"x"))]),
            source(vec![(b"a", Some(b"y")), (b"b", Some(b"y")), (b"c", Some(b"y"))]),
        ])
        .expect("Failed to build iterator");

        let keys: Vec<_> = collect(iter).into_iter().map(|(k, _)| k).collect();
        for window in keys.windows(2) {
            assert!(window[0] < window[1]);
        }
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_source_error_propagates() {
        let failing: SourceIter = Box::new(
            vec![
                Ok((b"a".to_vec(), Some(b"1".to_vec()))),
                Err(Error::Io("disk gone".to_string())),
            ]
            .into_iter(),
        );
        let mut iter = ScanIterator::new(vec![failing]).expect("Failed to build iterator");

        assert!(iter.next().expect("first item").is_ok());
        assert!(iter.next().expect("second item").is_err());
        assert!(iter.next().is_none(), "iterator stops after an error");
    }
}
