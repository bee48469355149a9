//! Immutable sorted segment files (SSTables).
//!
//! A segment is the on-disk unit produced by flushing a memtable. Once
//! written and published it is never modified; readers may share it freely,
//! each through its own cloned file handle.
//!
//! ## File Layout
//!
//! All integers are big-endian:
//!
//! ```text
//! +----------------------+
//! | index offset: u32    |  bytes 0..4, written last
//! +----------------------+
//! | data region          |  records in key order (shared codec)
//! +----------------------+
//! | sparse index         |  key_len:u16 | key | offset:u32 | size:u32 ...
//! +----------------------+
//! ```
//!
//! The data region is cut into blocks at a configured byte threshold; the
//! sparse index holds one descriptor per block. The header offset is
//! published with a positional write only after the data and index are on
//! disk, so a file whose header still reads zero was never finished.

pub mod index;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use self::index::{BlockMeta, SparseIndex};
use crate::error::{Error, Result};
use crate::record::{self, ReadOutcome};

/// Subdirectory of the store that holds segment files.
pub const SEGMENT_DIR: &str = "sstables";

/// Bytes reserved at the front of the file for the index offset.
pub const HEADER_SIZE: u64 = 4;

/// Path of segment `id` under the store directory.
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(SEGMENT_DIR).join(format!("segment_{id}.ss"))
}

/// Parses the ordinal out of a `segment_<n>.ss` file name.
pub fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("segment_")?
        .strip_suffix(".ss")?
        .parse()
        .ok()
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::CorruptSegment(format!("{}: {}", path.display(), reason))
}

/// Builds a new segment file. Records must arrive in ascending key order;
/// the flush path walks the frozen memtable, which guarantees it.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    index: SparseIndex,
    /// Current write offset in the file.
    offset: u64,
    /// Block size threshold; the final block may be shorter.
    block_bytes: usize,
    block_first_key: Option<Vec<u8>>,
    block_start: u64,
    block_size: usize,
}

impl SegmentWriter {
    pub fn create(path: impl Into<PathBuf>, block_bytes: usize) -> Result<Self> {
        let path = path.into();
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        // Reserve the header; the index offset lands here at finish time.
        // Until then the header reads zero, which marks the file unfinished.
        file.seek(SeekFrom::Start(HEADER_SIZE))?;

        Ok(Self {
            file,
            path,
            index: SparseIndex::new(),
            offset: HEADER_SIZE,
            block_bytes,
            block_first_key: None,
            block_start: HEADER_SIZE,
            block_size: 0,
        })
    }

    /// Appends one record; a `None` value writes a tombstone.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
            self.block_start = self.offset;
        }

        let mut buf = Vec::with_capacity(record::encoded_len(key, value));
        record::write_record(&mut buf, key, value)?;
        self.file.write_all(&buf)?;

        self.offset += buf.len() as u64;
        self.block_size += buf.len();

        if self.block_size >= self.block_bytes {
            self.close_block();
        }
        Ok(())
    }

    fn close_block(&mut self) {
        if let Some(first_key) = self.block_first_key.take() {
            self.index
                .push(first_key, self.block_start as u32, self.block_size as u32);
            self.block_size = 0;
        }
    }

    /// Writes the sparse index, publishes the header offset, and syncs.
    /// Reopens the finished file as a readable segment, which re-validates
    /// everything just written.
    pub fn finish(mut self) -> Result<Segment> {
        self.close_block();

        let index_offset = self.offset;
        if index_offset > u32::MAX as u64 {
            return Err(Error::InvalidInput(format!(
                "{}: segment exceeds the u32 offset limit",
                self.path.display()
            )));
        }

        self.file.write_all(&self.index.encode())?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_u32::<BigEndian>(index_offset as u32)?;
        self.file.sync_all()?;

        Segment::open(&self.path)
    }
}

/// A published, read-only segment.
#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    id: u64,
    index: SparseIndex,
    /// Where the data region ends and the sparse index begins.
    index_offset: u64,
}

impl Segment {
    /// Opens and validates a segment file. Every descriptor must point
    /// inside the data region; anything else fails the open. A corrupt
    /// segment is never silently accepted.
    pub fn open(path: &Path) -> Result<Self> {
        let id = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_segment_id)
            .ok_or_else(|| corrupt(path, "unrecognized segment file name"))?;

        let mut file = File::options().read(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE {
            return Err(corrupt(path, "file shorter than the header"));
        }

        let index_offset = file.read_u32::<BigEndian>()? as u64;
        if index_offset < HEADER_SIZE || index_offset > file_len {
            return Err(corrupt(
                path,
                format!("index offset {index_offset} outside file of {file_len} bytes"),
            ));
        }

        let mut buf = vec![0u8; (file_len - index_offset) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut buf)?;

        let index = SparseIndex::decode(&buf).map_err(|e| match e {
            Error::CorruptSegment(reason) => corrupt(path, reason),
            other => other,
        })?;

        for block in index.blocks() {
            let start = block.offset as u64;
            let end = start + block.size as u64;
            if start < HEADER_SIZE || end > index_offset {
                return Err(corrupt(
                    path,
                    format!("block [{start}, {end}) outside the data region"),
                ));
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            id,
            index,
            index_offset,
        })
    }

    /// Ordinal parsed from the file name; higher means newer.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point lookup. The outer `Option` distinguishes "not in this segment"
    /// from a present tombstone (`Some(None)`), which masks older segments.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let block = match self.index.find(key) {
            Some(block) => block,
            // Below the segment's whole key range
            None => return Ok(None),
        };

        let buf = self.read_block(block)?;
        let mut cursor = std::io::Cursor::new(buf.as_slice());
        loop {
            match record::read_record(&mut cursor)? {
                ReadOutcome::Record {
                    key: record_key,
                    value,
                    ..
                } => {
                    if record_key == key {
                        return Ok(Some(value));
                    }
                    // Keys are sorted: passing the target means it is absent
                    if record_key.as_slice() > key {
                        return Ok(None);
                    }
                }
                ReadOutcome::Eof => return Ok(None),
                ReadOutcome::Torn => {
                    return Err(corrupt(&self.path, "record truncated inside a block"))
                }
            }
        }
    }

    fn read_block(&self, block: &BlockMeta) -> Result<Vec<u8>> {
        // Per-reader handle: concurrent readers never fight over a seek position
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(block.offset as u64))?;
        let mut buf = vec![0u8; block.size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Ordered cursor over the records with keys in `[start, limit)`.
    ///
    /// Seeds at the block that may contain `start` and streams forward from
    /// there; blocks tile the data region, so iteration crosses block
    /// boundaries without re-seeking.
    pub fn scan(&self, start: &[u8], limit: &[u8]) -> Result<SegmentIter> {
        let seed = match self.index.find(start) {
            Some(block) => block.offset as u64,
            // Below the segment's range: every key qualifies
            None => match self.index.first() {
                Some(block) => block.offset as u64,
                None => self.index_offset,
            },
        };

        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(seed))?;

        Ok(SegmentIter {
            reader: BufReader::new(file),
            pos: seed,
            data_end: self.index_offset,
            start: start.to_vec(),
            limit: limit.to_vec(),
            path: self.path.clone(),
            done: false,
        })
    }
}

/// Forward iterator over a segment's records. Tombstones are yielded with a
/// `None` value so the merge layer can resolve newest-wins before
/// discarding them.
pub struct SegmentIter {
    reader: BufReader<File>,
    pos: u64,
    data_end: u64,
    start: Vec<u8>,
    limit: Vec<u8>,
    path: PathBuf,
    done: bool,
}

impl Iterator for SegmentIter {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.pos >= self.data_end {
                self.done = true;
                return None;
            }
            match record::read_record(&mut self.reader) {
                Ok(ReadOutcome::Record { key, value, len }) => {
                    self.pos += len as u64;
                    // Records before the seek target inside the seed block
                    if key.as_slice() < self.start.as_slice() {
                        continue;
                    }
                    if key.as_slice() >= self.limit.as_slice() {
                        self.done = true;
                        return None;
                    }
                    return Some(Ok((key, value)));
                }
                Ok(ReadOutcome::Eof | ReadOutcome::Torn) => {
                    self.done = true;
                    return Some(Err(corrupt(&self.path, "data region ends mid-record")));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    /// Writes a segment with a tiny block size so multi-block behavior is
    /// exercised even by small fixtures.
    fn write_segment(
        temp_dir: &TempDir,
        id: u64,
        entries: &[(&[u8], Option<&[u8]>)],
    ) -> Segment {
        std::fs::create_dir_all(temp_dir.path().join(SEGMENT_DIR))
            .expect("Failed to create segment dir");
        let path = segment_path(temp_dir.path(), id);
        let mut writer = SegmentWriter::create(&path, 20).expect("Failed to create writer");
        for (key, value) in entries {
            writer.append(key, *value).expect("Failed to append");
        }
        writer.finish().expect("Failed to finish segment")
    }

    #[test]
    fn test_write_and_get() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let segment = write_segment(
            &temp_dir,
            1,
            &[
                (b"apple", Some(b"fruit")),
                (b"application", Some(b"software")),
                (b"banana", Some(b"fruit")),
                (b"band", Some(b"music")),
                (b"bandana", Some(b"clothing")),
            ],
        );

        assert!(segment.index.len() > 1, "fixture should span several blocks");

        assert_eq!(
            segment.get(b"apple").expect("get failed"),
            Some(Some(b"fruit".to_vec()))
        );
        assert_eq!(
            segment.get(b"bandana").expect("get failed"),
            Some(Some(b"clothing".to_vec()))
        );
        // Key in a covered range but not present
        assert_eq!(segment.get(b"apricot").expect("get failed"), None);
        // Key below the whole segment
        assert_eq!(segment.get(b"aardvark").expect("get failed"), None);
        // Key above the whole segment
        assert_eq!(segment.get(b"zebra").expect("get failed"), None);
    }

    #[test]
    fn test_tombstone_is_reported_as_present() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let segment = write_segment(
            &temp_dir,
            1,
            &[(b"alive", Some(b"yes")), (b"dead", None)],
        );

        assert_eq!(
            segment.get(b"dead").expect("get failed"),
            Some(None),
            "a tombstone must be distinguishable from an absent key"
        );
        assert_eq!(
            segment.get(b"alive").expect("get failed"),
            Some(Some(b"yes".to_vec()))
        );
    }

    #[test]
    fn test_empty_value_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let segment = write_segment(&temp_dir, 1, &[(b"key", Some(b""))]);

        assert_eq!(segment.get(b"key").expect("get failed"), Some(Some(Vec::new())));
    }

    #[test]
    fn test_scan_range_across_blocks() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| {
                (
                    format!("key_{i:03}").into_bytes(),
                    format!("value_{i:03}").into_bytes(),
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], Option<&[u8]>)> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), Some(v.as_slice())))
            .collect();
        let segment = write_segment(&temp_dir, 1, &borrowed);

        let scanned: Vec<_> = segment
            .scan(b"key_010", b"key_020")
            .expect("Failed to create scan")
            .collect::<Result<Vec<_>>>()
            .expect("Scan failed");

        assert_eq!(scanned.len(), 10);
        assert_eq!(scanned[0].0, b"key_010");
        assert_eq!(scanned[9].0, b"key_019");
        for window in scanned.windows(2) {
            assert!(window[0].0 < window[1].0, "scan must be key-ascending");
        }
    }

    #[test]
    fn test_scan_start_below_range() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let segment = write_segment(
            &temp_dir,
            1,
            &[(b"m", Some(b"1")), (b"n", Some(b"2")), (b"o", Some(b"3"))],
        );

        let scanned: Vec<_> = segment
            .scan(b"a", b"z")
            .expect("Failed to create scan")
            .collect::<Result<Vec<_>>>()
            .expect("Scan failed");

        let keys: Vec<_> = scanned.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"m".to_vec(), b"n".to_vec(), b"o".to_vec()]);
    }

    #[test]
    fn test_scan_start_mid_block_skips_earlier_keys() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        // One large block: every record shares the seed block
        std::fs::create_dir_all(temp_dir.path().join(SEGMENT_DIR)).unwrap();
        let path = segment_path(temp_dir.path(), 1);
        let mut writer = SegmentWriter::create(&path, 4096).expect("Failed to create writer");
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            writer.append(key, Some(key)).expect("Failed to append");
        }
        let segment = writer.finish().expect("Failed to finish");
        assert_eq!(segment.index.len(), 1);

        let keys: Vec<_> = segment
            .scan(b"c", b"z")
            .expect("Failed to create scan")
            .collect::<Result<Vec<_>>>()
            .expect("Scan failed")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_scan_empty_range() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let segment = write_segment(&temp_dir, 1, &[(b"k", Some(b"v"))]);

        assert_eq!(
            segment.scan(b"x", b"z").expect("Failed to create scan").count(),
            0
        );
    }

    #[test]
    fn test_scan_includes_tombstones() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let segment = write_segment(
            &temp_dir,
            1,
            &[(b"a", Some(b"1")), (b"b", None), (b"c", Some(b"3"))],
        );

        let scanned: Vec<_> = segment
            .scan(b"a", b"z")
            .expect("Failed to create scan")
            .collect::<Result<Vec<_>>>()
            .expect("Scan failed");
        assert_eq!(scanned[1], (b"b".to_vec(), None));
    }

    #[test]
    fn test_open_rejects_unfinished_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(temp_dir.path().join(SEGMENT_DIR)).unwrap();
        let path = segment_path(temp_dir.path(), 7);

        // A writer that never reached finish leaves the header zeroed
        let mut writer = SegmentWriter::create(&path, 20).expect("Failed to create writer");
        writer.append(b"key", Some(b"value")).expect("Failed to append");
        drop(writer);

        let err = Segment::open(&path).expect_err("open should fail");
        assert!(matches!(err, Error::CorruptSegment(_)));
        assert!(err.to_string().contains("segment_7.ss"));
    }

    #[test]
    fn test_open_rejects_index_offset_past_eof() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(temp_dir.path().join(SEGMENT_DIR)).unwrap();
        let path = segment_path(temp_dir.path(), 3);

        let mut file = File::create(&path).expect("Failed to create file");
        file.write_u32::<BigEndian>(9999).unwrap();
        file.write_all(b"some data").unwrap();

        let err = Segment::open(&path).expect_err("open should fail");
        assert!(matches!(err, Error::CorruptSegment(_)));
    }

    #[test]
    fn test_open_rejects_block_outside_data_region() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(temp_dir.path().join(SEGMENT_DIR)).unwrap();
        let path = segment_path(temp_dir.path(), 4);

        // Hand-build a file whose only descriptor overruns the data region
        let mut index = SparseIndex::new();
        index.push(b"k".to_vec(), 4, 500);
        let encoded = index.encode();

        let mut file = File::create(&path).expect("Failed to create file");
        let data = b"xxxxxxxx";
        file.write_u32::<BigEndian>(HEADER_SIZE as u32 + data.len() as u32).unwrap();
        file.write_all(data).unwrap();
        file.write_all(&encoded).unwrap();

        let err = Segment::open(&path).expect_err("open should fail");
        assert!(matches!(err, Error::CorruptSegment(_)));
    }

    #[test]
    fn test_parse_segment_id() {
        assert_eq!(parse_segment_id("segment_1.ss"), Some(1));
        assert_eq!(parse_segment_id("segment_42.ss"), Some(42));
        assert_eq!(parse_segment_id("segment_.ss"), None);
        assert_eq!(parse_segment_id("segment_x.ss"), None);
        assert_eq!(parse_segment_id("journal.log"), None);
    }

    #[test]
    fn test_blocks_tile_data_region() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..30)
            .map(|i| (format!("k{i:02}").into_bytes(), b"value".to_vec()))
            .collect();
        let borrowed: Vec<(&[u8], Option<&[u8]>)> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), Some(v.as_slice())))
            .collect();
        let segment = write_segment(&temp_dir, 1, &borrowed);

        let mut expected_offset = HEADER_SIZE as u32;
        for block in segment.index.blocks() {
            assert_eq!(block.offset, expected_offset);
            expected_offset += block.size;
        }
        assert_eq!(expected_offset as u64, segment.index_offset);
    }
}
