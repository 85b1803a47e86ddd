use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};
use zerocopy::byteorder::{LittleEndian, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::alloc::{Bitmap, State};
use crate::error::{Result, StoreError};
use crate::io::{BlockDevice, BlockNumber};

/// Bytes taken by the header at the start of every block.
pub const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<RawBlockHeader>();

/// `next_block` value terminating a chain.
pub const END_OF_CHAIN: i32 = -1;

/// Per-block chain metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// File the block belongs to.
    pub owner_file_id: i32,
    /// Position of the block within its chain, starting at 0.
    pub sequence_index: i32,
    /// Next block of the chain or `END_OF_CHAIN`.
    pub next_block: i32,
    /// Number of meaningful payload bytes following the header.
    pub payload_size: i32,
}

/// On-disk image of `BlockHeader`: four little endian i32s.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawBlockHeader {
    owner_file_id: I32<LittleEndian>,
    sequence_index: I32<LittleEndian>,
    next_block: I32<LittleEndian>,
    payload_size: I32<LittleEndian>,
}

impl From<&BlockHeader> for RawBlockHeader {
    fn from(h: &BlockHeader) -> Self {
        Self {
            owner_file_id: I32::new(h.owner_file_id),
            sequence_index: I32::new(h.sequence_index),
            next_block: I32::new(h.next_block),
            payload_size: I32::new(h.payload_size),
        }
    }
}

impl From<RawBlockHeader> for BlockHeader {
    fn from(raw: RawBlockHeader) -> Self {
        Self {
            owner_file_id: raw.owner_file_id.get(),
            sequence_index: raw.sequence_index.get(),
            next_block: raw.next_block.get(),
            payload_size: raw.payload_size.get(),
        }
    }
}

impl BlockHeader {
    pub fn new(owner_file_id: i32, sequence_index: i32, next_block: i32) -> Self {
        Self {
            owner_file_id,
            sequence_index,
            next_block,
            payload_size: 0,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_block == END_OF_CHAIN
    }

    pub fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0; BLOCK_HEADER_SIZE];
        out.copy_from_slice(RawBlockHeader::from(self).as_bytes());
        out
    }

    /// Reads a header from the first `BLOCK_HEADER_SIZE` bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        RawBlockHeader::read_from_prefix(buf).map(BlockHeader::from)
    }
}

/// Fixed-size block I/O with first-fit allocation over a single device.
///
/// The store owns the occupancy `Bitmap`; the bitmap is only written to its
/// image file on `save_bitmap`, callers decide when that happens.
pub struct BlockStore<D: BlockDevice> {
    dev: D,
    bitmap: Bitmap,
    bitmap_path: PathBuf,
    /// Reusable buffer for whole-block transfers.
    scratch: Vec<u8>,
}

impl<D: BlockDevice> BlockStore<D> {
    /// Wraps `dev`, restoring block occupancy from the image at `bitmap_path`.
    /// A missing image means a fresh store: every block starts free and an
    /// initial image is written immediately.
    pub fn open<P: AsRef<Path>>(dev: D, bitmap_path: P) -> Result<Self> {
        let total = dev.block_count();
        let block_size = dev.block_size();
        let mut store = Self {
            dev,
            bitmap: Bitmap::new(total),
            bitmap_path: bitmap_path.as_ref().to_path_buf(),
            scratch: vec![0; block_size],
        };
        if store.load_bitmap()? {
            info!(
                "Loaded block bitmap: {}/{} blocks used.",
                store.used_blocks(),
                total
            );
        } else {
            info!("No block bitmap found, starting with {} free blocks.", total);
            store.save_bitmap()?;
        }
        Ok(store)
    }

    pub fn total_blocks(&self) -> usize {
        self.bitmap.len()
    }

    pub fn used_blocks(&self) -> usize {
        self.bitmap.used()
    }

    pub fn free_blocks(&self) -> usize {
        self.bitmap.free()
    }

    pub fn block_size(&self) -> usize {
        self.dev.block_size()
    }

    /// Payload bytes one block can hold.
    pub fn payload_capacity(&self) -> usize {
        self.dev.block_size() - BLOCK_HEADER_SIZE
    }

    pub fn is_used(&self, blocknr: BlockNumber) -> bool {
        blocknr < self.total_blocks() && self.bitmap.get(blocknr) == State::Used
    }

    /// Validates a block number taken from disk or a caller.
    pub fn check_range(&self, blocknr: i64) -> Result<BlockNumber> {
        if blocknr < 0 || blocknr as u64 >= self.total_blocks() as u64 {
            return Err(StoreError::BlockOutOfRange {
                block: blocknr,
                total: self.total_blocks(),
            });
        }
        Ok(blocknr as BlockNumber)
    }

    /// Marks the lowest free block used and returns its number.
    pub fn allocate_block(&mut self) -> Result<BlockNumber> {
        let blocknr = self.bitmap.first_free().ok_or(StoreError::DiskFull)?;
        self.bitmap.set_reserved(blocknr);
        trace!("Allocated block {} ({} used).", blocknr, self.used_blocks());
        Ok(blocknr)
    }

    /// Releases a block and zero-fills it on disk. Freeing an already free
    /// block only logs a warning.
    pub fn free_block(&mut self, blocknr: BlockNumber) -> Result<()> {
        self.check_range(blocknr as i64)?;
        if !self.bitmap.set_free(blocknr) {
            warn!("Block {} freed twice, ignoring.", blocknr);
            return Ok(());
        }
        for b in self.scratch.iter_mut() {
            *b = 0;
        }
        self.dev.write_block(blocknr, &self.scratch)?;
        trace!("Freed block {} ({} used).", blocknr, self.used_blocks());
        Ok(())
    }

    /// Writes `header` followed by `payload` into block `blocknr`, zero padding
    /// the rest of the block. `header.payload_size` is taken from `payload`.
    pub fn write_block(
        &mut self,
        blocknr: BlockNumber,
        header: &BlockHeader,
        payload: &[u8],
    ) -> Result<()> {
        self.check_range(blocknr as i64)?;
        let capacity = self.payload_capacity();
        if payload.len() > capacity {
            return Err(StoreError::PayloadTooLarge {
                size: payload.len(),
                capacity,
            });
        }

        let header = BlockHeader {
            payload_size: payload.len() as i32,
            ..*header
        };
        let end = BLOCK_HEADER_SIZE + payload.len();
        self.scratch[..BLOCK_HEADER_SIZE].copy_from_slice(&header.serialize());
        self.scratch[BLOCK_HEADER_SIZE..end].copy_from_slice(payload);
        for b in self.scratch[end..].iter_mut() {
            *b = 0;
        }
        self.dev.write_block(blocknr, &self.scratch)?;
        trace!(
            "Wrote block {}: file {} seq {} next {} ({} bytes).",
            blocknr,
            header.owner_file_id,
            header.sequence_index,
            header.next_block,
            header.payload_size
        );
        Ok(())
    }

    /// Reads block `blocknr`, returning its header and exactly
    /// `header.payload_size` payload bytes.
    pub fn read_block(&mut self, blocknr: BlockNumber) -> Result<(BlockHeader, Vec<u8>)> {
        self.check_range(blocknr as i64)?;
        self.dev.read_block(blocknr, &mut self.scratch)?;

        let header = BlockHeader::parse(&self.scratch)
            .ok_or(StoreError::InvalidRecord("block shorter than its header"))?;
        if header.payload_size < 0 || header.payload_size as usize > self.payload_capacity() {
            return Err(StoreError::corrupt_chain(
                header.owner_file_id,
                format!(
                    "block {} claims {} payload bytes",
                    blocknr, header.payload_size
                ),
            ));
        }
        let end = BLOCK_HEADER_SIZE + header.payload_size as usize;
        Ok((header, self.scratch[BLOCK_HEADER_SIZE..end].to_vec()))
    }

    /// Persists the bitmap image (used-count header and bits).
    pub fn save_bitmap(&mut self) -> Result<()> {
        let mut file = File::create(&self.bitmap_path)?;
        file.write_all(&self.bitmap.to_image())?;
        file.sync_all()?;
        debug!(
            "Saved bitmap to {} ({} used).",
            self.bitmap_path.display(),
            self.used_blocks()
        );
        Ok(())
    }

    /// Restores the bitmap from its image. Returns false if no image exists.
    ///
    /// A used-count header disagreeing with the bits is reported and the
    /// scanned count is kept.
    pub fn load_bitmap(&mut self) -> Result<bool> {
        let image = match fs::read(&self.bitmap_path) {
            Ok(image) => image,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let (bitmap, recorded) = Bitmap::from_image(&image, self.total_blocks())?;
        if recorded < 0 || recorded as usize != bitmap.used() {
            warn!(
                "Bitmap header records {} used blocks but {} are marked, trusting the bits.",
                recorded,
                bitmap.used()
            );
        }
        self.bitmap = bitmap;
        Ok(true)
    }

    /// Flushes the device and the bitmap image.
    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync_disk()?;
        self.save_bitmap()
    }
}
