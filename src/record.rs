//! On-disk record codec shared by the journal and segment files.
//!
//! ## Record Format
//!
//! Each record is variable-length (all integers big-endian):
//!
//! ```text
//! +------+-----------+-------+-----------+-------+
//! |op: u8|key_len:u16| key   |val_len:u16| value |
//! +------+-----------+-------+-----------+-------+
//! |1 byte|  2 bytes  |var len|  2 bytes  |var len|
//! +------+-----------+-------+-----------+-------+
//! ```
//!
//! `op` is `Insert (1)` or `Delete (0)`. Delete records always encode
//! `val_len = 0` with no value bytes, in the journal and in segments alike,
//! so every reader can read the length field unconditionally. An Insert with
//! `val_len = 0` is a present empty value, distinct from a delete.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::Result;

pub const OP_DELETE: u8 = 0;
pub const OP_INSERT: u8 = 1;

/// Bytes one record occupies on disk.
pub fn encoded_len(key: &[u8], value: Option<&[u8]>) -> usize {
    1 + 2 + key.len() + 2 + value.map_or(0, |v| v.len())
}

/// Writes one record. A `None` value writes a Delete record.
pub fn write_record<W: Write>(w: &mut W, key: &[u8], value: Option<&[u8]>) -> Result<usize> {
    match value {
        Some(val) => {
            w.write_u8(OP_INSERT)?;
            w.write_u16::<BigEndian>(key.len() as u16)?;
            w.write_all(key)?;
            w.write_u16::<BigEndian>(val.len() as u16)?;
            w.write_all(val)?;
        }
        None => {
            w.write_u8(OP_DELETE)?;
            w.write_u16::<BigEndian>(key.len() as u16)?;
            w.write_all(key)?;
            w.write_u16::<BigEndian>(0)?;
        }
    }
    Ok(encoded_len(key, value))
}

/// Outcome of reading one record from a stream.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// A whole record. `value` is `None` for a Delete. `len` is the number
    /// of bytes the record occupied.
    Record {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        len: usize,
    },
    /// The stream ended cleanly on a record boundary.
    Eof,
    /// The stream ended in the middle of a record. The caller decides
    /// whether this is a tolerable torn tail (journal recovery) or
    /// corruption (segment data).
    Torn,
}

/// Reads one record. IO failures other than end-of-stream propagate.
pub fn read_record<R: Read>(r: &mut R) -> Result<ReadOutcome> {
    let op = match r.read_u8() {
        Ok(op) => op,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::Eof),
        Err(e) => return Err(e.into()),
    };

    match read_body(r, op) {
        Ok((key, value, len)) => Ok(ReadOutcome::Record { key, value, len }),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(ReadOutcome::Torn),
        Err(e) => Err(e.into()),
    }
}

fn read_body<R: Read>(r: &mut R, op: u8) -> io::Result<(Vec<u8>, Option<Vec<u8>>, usize)> {
    if op != OP_INSERT && op != OP_DELETE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid record op {op}"),
        ));
    }

    let key_len = r.read_u16::<BigEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key)?;

    let val_len = r.read_u16::<BigEndian>()? as usize;
    let mut val = vec![0u8; val_len];
    r.read_exact(&mut val)?;

    let value = if op == OP_INSERT { Some(val) } else { None };
    Ok((key, value, 1 + 2 + key_len + 2 + val_len))
}
