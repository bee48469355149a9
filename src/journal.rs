//! Append-only write-ahead journal.
//!
//! Every mutation is appended here and synced to disk before it touches the
//! memtable, so a crash can never lose an acknowledged write that a segment
//! does not already cover. The file is a bare concatenation of records in
//! the shared codec (`record`), with no header and no footer.
//!
//! Recovery replays the journal from the start into a fresh memtable. A
//! torn trailing record (the process died mid-append) ends the replay; the
//! records before the tear stand, the tear is discarded. Replay is
//! idempotent.
//!
//! After a flush makes a new segment durably visible, the journal is
//! truncated to zero length. The ordering is owned by the flush path: sync
//! the segment, install it, then truncate.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::record::{self, ReadOutcome};

pub const JOURNAL_FILENAME: &str = "journal.log";

pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Opens or creates the journal, positioned for appending. Existing
    /// content is preserved for replay.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;

        Ok(Self { file, path })
    }

    /// Appends one record and syncs it to disk before returning. When this
    /// fails the caller must not apply the mutation to the memtable.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut buf = Vec::with_capacity(record::encoded_len(key, value));
        record::write_record(&mut buf, key, value)?;

        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replays the journal from the start through an independent read
    /// handle, so replay never disturbs the append position.
    pub fn replay(&self) -> Result<ReplayIterator> {
        let file = File::open(&self.path)?;
        Ok(ReplayIterator {
            reader: BufReader::new(file),
            path: self.path.clone(),
            done: false,
        })
    }

    /// Empties the journal. Called only after a new segment is durably
    /// installed.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Yields `(key, value)` pairs in append order; `None` values are
/// tombstones. Stops cleanly at a torn trailing record.
pub struct ReplayIterator {
    reader: BufReader<File>,
    path: PathBuf,
    done: bool,
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match record::read_record(&mut self.reader) {
            Ok(ReadOutcome::Record { key, value, .. }) => Some(Ok((key, value))),
            Ok(ReadOutcome::Eof) => {
                self.done = true;
                None
            }
            Ok(ReadOutcome::Torn) => {
                self.done = true;
                tracing::warn!(
                    path = %self.path.display(),
                    "journal ends mid-record, discarding torn tail"
                );
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
