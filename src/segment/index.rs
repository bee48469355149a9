//! Sparse block index for segment files.
//!
//! One descriptor per data block: the first key in the block plus the
//! block's byte range. Descriptors are key-ascending and their ranges tile
//! the data region without overlap, so the block that may contain a key is
//! the greatest one whose first key does not exceed it.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Descriptor for one data block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    /// First key stored in the block.
    pub first_key: Vec<u8>,
    /// Byte offset of the block within the segment file.
    pub offset: u32,
    /// Byte length of the block.
    pub size: u32,
}

/// The in-memory sparse index of a segment, ordered by first key.
#[derive(Debug, Default)]
pub struct SparseIndex {
    blocks: Vec<BlockMeta>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Appends a descriptor. Blocks arrive in key order from the writer.
    pub fn push(&mut self, first_key: Vec<u8>, offset: u32, size: u32) {
        self.blocks.push(BlockMeta {
            first_key,
            offset,
            size,
        });
    }

    /// Finds the block that may contain `key`: the greatest block whose
    /// first key is `<= key`. Returns `None` when `key` sorts below the
    /// whole segment.
    pub fn find(&self, key: &[u8]) -> Option<&BlockMeta> {
        let idx = self
            .blocks
            .partition_point(|block| block.first_key.as_slice() <= key);
        if idx == 0 {
            None
        } else {
            Some(&self.blocks[idx - 1])
        }
    }

    pub fn first(&self) -> Option<&BlockMeta> {
        self.blocks.first()
    }

    pub fn blocks(&self) -> &[BlockMeta] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serializes the index: per block `key_len:u16 | key | offset:u32 |
    /// size:u32`, big-endian, no framing. The segment header locates it.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for block in &self.blocks {
            // Lengths were validated on the write path; the buffer cannot fail
            buf.write_u16::<BigEndian>(block.first_key.len() as u16).unwrap();
            buf.extend_from_slice(&block.first_key);
            buf.write_u32::<BigEndian>(block.offset).unwrap();
            buf.write_u32::<BigEndian>(block.size).unwrap();
        }
        buf
    }

    /// Parses descriptors until the buffer is exhausted. Any short read is
    /// corruption: the index must end exactly on a descriptor boundary.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let mut blocks = Vec::new();

        while (cursor.position() as usize) < buf.len() {
            let key_len = cursor
                .read_u16::<BigEndian>()
                .map_err(|_| corrupt("block descriptor truncated"))? as usize;

            let remaining = buf.len() - cursor.position() as usize;
            if key_len > remaining {
                return Err(corrupt("descriptor key length exceeds remaining bytes"));
            }
            let mut first_key = vec![0u8; key_len];
            cursor
                .read_exact(&mut first_key)
                .map_err(|_| corrupt("block descriptor truncated"))?;

            let offset = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| corrupt("block descriptor truncated"))?;
            let size = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| corrupt("block descriptor truncated"))?;

            blocks.push(BlockMeta {
                first_key,
                offset,
                size,
            });
        }

        Ok(Self { blocks })
    }
}

fn corrupt(reason: &str) -> Error {
    Error::CorruptSegment(reason.to_string())
}
