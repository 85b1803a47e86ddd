use zerocopy::byteorder::{LittleEndian, I32, I64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::{Result, StoreError};

/// Child slot value for "no child".
pub const NO_CHILD: i64 = -1;
/// Offset of a node that has not been written yet.
pub const UNWRITTEN: i64 = -1;
/// `first_block` of a removed entry.
pub const NO_BLOCK: i32 = -1;

/// One key of the index: a file id and the first block of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub file_id: i32,
    pub first_block: i32,
    /// False once the entry was removed. The slot stays in its node.
    pub in_use: bool,
}

impl IndexEntry {
    pub fn new(file_id: i32, first_block: i32) -> Self {
        Self {
            file_id,
            first_block,
            in_use: true,
        }
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawNodeHeader {
    is_leaf: u8,
    key_count: I32<LittleEndian>,
    self_offset: I64<LittleEndian>,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawEntry {
    file_id: I32<LittleEndian>,
    first_block: I32<LittleEndian>,
    in_use: u8,
}

const NODE_HEADER_SIZE: usize = std::mem::size_of::<RawNodeHeader>();
const ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();
const CHILD_SIZE: usize = std::mem::size_of::<i64>();

/// Size in bytes of every node record for minimum degree `t`.
pub fn node_size(t: usize) -> usize {
    NODE_HEADER_SIZE + (2 * t - 1) * ENTRY_SIZE + 2 * t * CHILD_SIZE
}

/// A B-tree node as held in memory for the span of one operation.
///
/// Only live slots are kept: `entries` holds `key_count` entries and, for
/// internal nodes, `children` holds `key_count + 1` offsets. Encoding pads both
/// out to the fixed record capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub is_leaf: bool,
    pub entries: Vec<IndexEntry>,
    pub children: Vec<i64>,
    /// Byte offset of this node's record in the index file, its on-disk identity.
    pub offset: i64,
}

impl Node {
    pub fn leaf() -> Self {
        Self {
            is_leaf: true,
            entries: Vec::new(),
            children: Vec::new(),
            offset: UNWRITTEN,
        }
    }

    pub fn internal() -> Self {
        Self {
            is_leaf: false,
            ..Node::leaf()
        }
    }

    pub fn is_full(&self, t: usize) -> bool {
        self.entries.len() >= 2 * t - 1
    }

    /// Position of `file_id`: `Ok` if present, otherwise `Err` with the slot it
    /// would be inserted at, which is also the child to descend into.
    pub fn find(&self, file_id: i32) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&file_id, |e| e.file_id)
    }

    pub fn encode(&self, t: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(node_size(t));
        let header = RawNodeHeader {
            is_leaf: self.is_leaf as u8,
            key_count: I32::new(self.entries.len() as i32),
            self_offset: I64::new(self.offset),
        };
        buf.extend_from_slice(header.as_bytes());

        for slot in 0..(2 * t - 1) {
            let raw = match self.entries.get(slot) {
                Some(e) => RawEntry {
                    file_id: I32::new(e.file_id),
                    first_block: I32::new(e.first_block),
                    in_use: e.in_use as u8,
                },
                None => RawEntry::new_zeroed(),
            };
            buf.extend_from_slice(raw.as_bytes());
        }
        for slot in 0..(2 * t) {
            let child = self.children.get(slot).copied().unwrap_or(NO_CHILD);
            buf.extend_from_slice(&child.to_le_bytes());
        }
        buf
    }

    /// Decodes the record read at `offset`. The record must name `offset` as
    /// its own location and hold a plausible key count.
    pub fn decode(buf: &[u8], t: usize, offset: i64) -> Result<Self> {
        if buf.len() < node_size(t) {
            return Err(StoreError::IndexCorruption(format!(
                "node record at {} is truncated",
                offset
            )));
        }
        let header = RawNodeHeader::read_from_prefix(buf).ok_or_else(|| {
            StoreError::IndexCorruption(format!("node header at {} unreadable", offset))
        })?;
        let key_count = header.key_count.get();
        if key_count < 0 || key_count as usize > 2 * t - 1 {
            return Err(StoreError::IndexCorruption(format!(
                "node at {} claims {} keys",
                offset, key_count
            )));
        }
        if header.self_offset.get() != offset {
            return Err(StoreError::IndexCorruption(format!(
                "node read at {} records offset {}",
                offset,
                header.self_offset.get()
            )));
        }
        let is_leaf = match header.is_leaf {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::IndexCorruption(format!(
                    "node at {} has leaf flag {}",
                    offset, other
                )))
            }
        };

        let n = key_count as usize;
        let mut entries = Vec::with_capacity(n);
        let mut pos = NODE_HEADER_SIZE;
        for _ in 0..n {
            let raw = RawEntry::read_from_prefix(&buf[pos..]).ok_or_else(|| {
                StoreError::IndexCorruption(format!("entry in node {} unreadable", offset))
            })?;
            entries.push(IndexEntry {
                file_id: raw.file_id.get(),
                first_block: raw.first_block.get(),
                in_use: raw.in_use != 0,
            });
            pos += ENTRY_SIZE;
        }

        let mut children = Vec::new();
        if !is_leaf {
            let mut pos = NODE_HEADER_SIZE + (2 * t - 1) * ENTRY_SIZE;
            for _ in 0..=n {
                let mut raw = [0u8; CHILD_SIZE];
                raw.copy_from_slice(&buf[pos..pos + CHILD_SIZE]);
                children.push(i64::from_le_bytes(raw));
                pos += CHILD_SIZE;
            }
        }

        Ok(Self {
            is_leaf,
            entries,
            children,
            offset,
        })
    }
}
