//! Database façade: recovery, reads, writes, and flush orchestration.
//!
//! ## Write Path
//!
//! `put`/`delete` append to the journal (synced before anything else
//! happens), insert into the live memtable, then check the size threshold.
//! Crossing it rotates the live memtable into the frozen slot and hands it
//! to the background flush thread; the writer returns immediately and new
//! writes land in a fresh memtable.
//!
//! ## Read Path
//!
//! `get` consults the live memtable, then the frozen memtable while a flush
//! is running, then segments newest first. A tombstone found at any layer
//! masks everything older. The frozen layer closes the window where a key
//! has left the live memtable but its segment is not yet installed.
//!
//! ## Flush Ordering
//!
//! Write the segment, sync it, install it at the front of the segment list,
//! truncate the journal, release the frozen memtable, always in that
//! order. A failed flush deletes the partial file and keeps both the frozen
//! memtable and the journal, so nothing acknowledged is lost. At most one
//! flush runs at a time: a writer that crosses the threshold again first
//! joins the running flush (backpressure, never dropped work).

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::iterator::{ScanIterator, SourceIter};
use crate::journal::{Journal, JOURNAL_FILENAME};
use crate::memtable::Memtable;
use crate::segment::{parse_segment_id, segment_path, Segment, SegmentWriter, SEGMENT_DIR};

/// An embedded, ordered key-value store.
pub struct Db {
    config: Config,
    state: Arc<DbState>,
}

struct DbState {
    /// Live memtable; every write lands here.
    active: RwLock<Arc<Memtable>>,
    /// Memtable being flushed, still visible to readers.
    frozen: RwLock<Option<Arc<Memtable>>>,
    /// Segments, newest first.
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Journal; its lock is also the exclusive writer section.
    journal: Mutex<Journal>,
    next_segment_id: AtomicU64,
    /// Single background flush slot.
    flush_slot: Mutex<Option<JoinHandle<()>>>,
}

impl Db {
    /// Opens the store: replays the journal into a fresh memtable and loads
    /// the existing segments, newest first.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        fs::create_dir_all(config.dir.join(SEGMENT_DIR))?;

        let journal = Journal::open(config.dir.join(JOURNAL_FILENAME))?;

        // Journaling is off during replay: records go straight back into
        // the memtable they were logged for.
        let memtable = Memtable::new();
        let mut recovered = 0usize;
        for entry in journal.replay()? {
            let (key, value) = entry?;
            memtable.put(key, value);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(records = recovered, "replayed journal into memtable");
        }

        let segments = load_segments(&config.dir)?;
        let next_segment_id = segments.first().map_or(1, |s| s.id() + 1);
        tracing::info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            "opened store"
        );

        Ok(Self {
            config,
            state: Arc::new(DbState {
                active: RwLock::new(Arc::new(memtable)),
                frozen: RwLock::new(None),
                segments: RwLock::new(segments),
                journal: Mutex::new(journal),
                next_segment_id: AtomicU64::new(next_segment_id),
                flush_slot: Mutex::new(None),
            }),
        })
    }

    /// Looks up `key`. `Ok(None)` means the key is absent from the whole
    /// store or masked by a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.state.active.read().unwrap().get(key) {
            return Ok(value);
        }

        if let Some(frozen) = self.state.frozen.read().unwrap().as_ref() {
            if let Some(value) = frozen.get(key) {
                return Ok(value);
            }
        }

        let segments = self.state.segments.read().unwrap().clone();
        for segment in &segments {
            if let Some(value) = segment.get(key)? {
                return Ok(value);
            }
        }

        Ok(None)
    }

    /// Inserts or replaces `key`. An empty value is a valid value, not a
    /// delete. Returns only after the journal record is on disk.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Deletes `key` by persisting a tombstone, which also masks any copy
    /// of the key living in older segments.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "key length {} exceeds {}",
                key.len(),
                u16::MAX
            )));
        }
        if let Some(v) = value {
            if v.len() > u16::MAX as usize {
                return Err(Error::InvalidInput(format!(
                    "value length {} exceeds {}",
                    v.len(),
                    u16::MAX
                )));
            }
        }

        let over_threshold = {
            // Exclusive writer section: journal append, then memtable
            // insert. A failed append leaves the memtable untouched.
            let mut journal = self.state.journal.lock().unwrap();
            journal.append(key, value)?;

            let active = self.state.active.read().unwrap();
            active.put(key.to_vec(), value.map(|v| v.to_vec()));
            active.size() >= self.config.max_memtable_bytes
        };

        if over_threshold {
            self.trigger_flush()?;
        }
        Ok(())
    }

    /// Forward scan over `start <= key < limit`, merged across the live
    /// memtable, the frozen memtable, and every segment, newest first.
    pub fn scan(&self, start: &[u8], limit: &[u8]) -> Result<ScanIterator> {
        let mut sources: Vec<SourceIter> = Vec::new();

        let live = self.state.active.read().unwrap().scan(start, limit);
        sources.push(Box::new(live.into_iter().map(Ok)));

        if let Some(frozen) = self.state.frozen.read().unwrap().as_ref() {
            let entries = frozen.scan(start, limit);
            sources.push(Box::new(entries.into_iter().map(Ok)));
        }

        let segments = self.state.segments.read().unwrap().clone();
        for segment in &segments {
            sources.push(Box::new(segment.scan(start, limit)?));
        }

        ScanIterator::new(sources)
    }

    /// Approximate size in bytes of the live memtable. Segments are not
    /// counted.
    pub fn size(&self) -> usize {
        self.state.active.read().unwrap().size()
    }

    /// Synchronously flushes outstanding memtables to segments. Returns
    /// `false` when there was nothing to flush. Waits for any background
    /// flush first, so the store holds no unflushed frozen data afterwards.
    pub fn flush(&self) -> Result<bool> {
        let mut slot = self.state.flush_slot.lock().unwrap();
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }

        let mut flushed = false;

        // A failed background flush leaves its memtable parked in the
        // frozen slot; retry it before rotating again.
        let leftover = self.state.frozen.read().unwrap().clone();
        if let Some(frozen) = leftover {
            self.flush_now(&frozen)?;
            flushed = true;
        }

        if let Some(frozen) = self.rotate() {
            self.flush_now(&frozen)?;
            flushed = true;
        }

        Ok(flushed)
    }

    /// Moves the live memtable into the frozen slot and installs a fresh
    /// one. Readers observe the frozen slot before the swap, so no window
    /// exists where the rotated data is invisible.
    fn rotate(&self) -> Option<Arc<Memtable>> {
        let mut active = self.state.active.write().unwrap();
        if active.is_empty() {
            return None;
        }
        let mut frozen_slot = self.state.frozen.write().unwrap();
        let old = Arc::clone(&active);
        *frozen_slot = Some(Arc::clone(&old));
        *active = Arc::new(Memtable::new());
        Some(old)
    }

    fn flush_now(&self, memtable: &Memtable) -> Result<()> {
        let id = self.state.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = segment_path(&self.config.dir, id);
        flush_frozen(&self.state, memtable, &path, self.config.block_bytes)
    }

    /// Rotates and hands the frozen memtable to a background thread.
    /// Joining the previous flush first serializes flushes on the single
    /// slot and is the writer's backpressure bound.
    fn trigger_flush(&self) -> Result<()> {
        let mut slot = self.state.flush_slot.lock().unwrap();
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }

        // Retry the memtable a failed background flush left behind;
        // surfacing the error here keeps the writer informed.
        let leftover = self.state.frozen.read().unwrap().clone();
        if let Some(frozen) = leftover {
            self.flush_now(&frozen)?;
        }

        let frozen = match self.rotate() {
            Some(frozen) => frozen,
            None => return Ok(()),
        };

        let id = self.state.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = segment_path(&self.config.dir, id);
        let block_bytes = self.config.block_bytes;
        let state = Arc::clone(&self.state);

        *slot = Some(std::thread::spawn(move || {
            if let Err(e) = flush_frozen(&state, &frozen, &path, block_bytes) {
                tracing::error!(
                    segment = %path.display(),
                    error = %e,
                    "flush failed, keeping frozen memtable and journal"
                );
            }
        }));

        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let mut slot = self.state.flush_slot.lock().unwrap();
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }
    }
}

/// The flush body. On success the segment is durably on disk and installed
/// before the journal is truncated. On failure the partial file is removed
/// and the frozen memtable and journal are left intact for a retry.
fn flush_frozen(
    state: &DbState,
    memtable: &Memtable,
    path: &Path,
    block_bytes: usize,
) -> Result<()> {
    let entry_count = memtable.len();

    let segment = match write_segment(memtable, path, block_bytes) {
        Ok(segment) => segment,
        Err(e) => {
            let _ = fs::remove_file(path);
            return Err(e);
        }
    };

    // Durably written: install, then truncate the journal, then release
    // the frozen memtable.
    state.segments.write().unwrap().insert(0, Arc::new(segment));
    state.journal.lock().unwrap().truncate()?;
    *state.frozen.write().unwrap() = None;

    tracing::info!(
        segment = %path.display(),
        entries = entry_count,
        "flushed memtable to segment"
    );
    Ok(())
}

fn write_segment(memtable: &Memtable, path: &Path, block_bytes: usize) -> Result<Segment> {
    let mut writer = SegmentWriter::create(path, block_bytes)?;
    for (key, value) in memtable.entries() {
        writer.append(&key, value.as_deref())?;
    }
    writer.finish()
}

/// Enumerates `sstables/segment_<n>.ss`, newest first. A file whose header
/// still reads zero was never finished (the writer died before publishing
/// the index offset) and is discarded. Anything else that fails validation
/// fails the open.
fn load_segments(dir: &Path) -> Result<Vec<Arc<Segment>>> {
    use byteorder::{BigEndian, ReadBytesExt};

    let mut segments = Vec::new();
    for entry in fs::read_dir(dir.join(SEGMENT_DIR))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if parse_segment_id(name).is_none() {
            continue;
        }
        let path = entry.path();

        let unfinished = {
            let mut file = fs::File::open(&path)?;
            match file.read_u32::<BigEndian>() {
                Ok(offset) => offset == 0,
                Err(_) => true,
            }
        };
        if unfinished {
            tracing::warn!(path = %path.display(), "discarding unfinished segment");
            fs::remove_file(&path)?;
            continue;
        }

        segments.push(Arc::new(Segment::open(&path)?));
    }

    segments.sort_by(|a, b| b.id().cmp(&a.id()));
    Ok(segments)
}
