use std::path::PathBuf;

/// Memtable size threshold, in bytes, that triggers a flush to a new
/// segment. Kept small so tests cross it quickly; production deployments
/// raise it through the builder.
pub const MAX_MEMTABLE_BYTES: usize = 4000;

/// Target byte size of a segment data block. Should be a multiple of the
/// disk block size (e.g. 4 KiB) in production.
pub const INDEX_BLOCK_BYTES: usize = 20;

/// Configuration for the store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the journal and the segment subdirectory.
    pub dir: PathBuf,

    /// Flush the live memtable once its approximate size reaches this.
    pub max_memtable_bytes: usize,

    /// Close a segment data block once it reaches this many bytes.
    pub block_bytes: usize,
}

impl Config {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_memtable_bytes: MAX_MEMTABLE_BYTES,
            block_bytes: INDEX_BLOCK_BYTES,
        }
    }

    /// Set the memtable flush threshold.
    pub fn max_memtable_bytes(mut self, bytes: usize) -> Self {
        self.max_memtable_bytes = bytes;
        self
    }

    /// Set the segment block size target.
    pub fn block_bytes(mut self, bytes: usize) -> Self {
        self.block_bytes = bytes;
        self
    }
}
