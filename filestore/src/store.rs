use std::collections::BTreeSet;
use std::fs;

use log::{debug, error, info, warn};

use crate::block::{BlockHeader, BlockStore, END_OF_CHAIN};
use crate::chain::ChainCodec;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::index::BTreeIndex;
use crate::io::{BlockDevice, BlockNumber, FileBlockDevice};
use crate::record::FileRecord;

/// Block usage of a store at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStats {
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub block_size: usize,
}

impl DiskStats {
    pub fn used_bytes(&self) -> u64 {
        self.used_blocks as u64 * self.block_size as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }

    pub fn used_mib(&self) -> f64 {
        self.used_bytes() as f64 / (1024.0 * 1024.0)
    }

    pub fn total_mib(&self) -> f64 {
        self.total_bytes() as f64 / (1024.0 * 1024.0)
    }
}

/// Persistent store of `FileRecord`s.
///
/// Every record is serialized, cut into a chain of blocks and indexed by file
/// id. Nothing is cached between calls and no locking happens inside: callers
/// sharing a store serialize access themselves (see `StoreHandle`).
pub struct FileStore<D: BlockDevice = FileBlockDevice> {
    blocks: BlockStore<D>,
    index: BTreeIndex,
    codec: ChainCodec,
}

impl FileStore<FileBlockDevice> {
    /// Opens the store described by `config`, creating its directory and
    /// backing files on first use.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let dev = FileBlockDevice::open(config.disk_path(), config.block_size, config.total_blocks)?;
        let blocks = BlockStore::open(dev, config.bitmap_path())?;
        let index = BTreeIndex::open(config.index_path(), config.min_degree)?;
        let store = Self::from_parts(blocks, index);

        let stats = store.stats();
        info!(
            "Opened file store at {}: {}/{} blocks used ({:.2} MiB / {:.2} MiB).",
            config.dir.display(),
            stats.used_blocks,
            stats.total_blocks,
            stats.used_mib(),
            stats.total_mib()
        );
        Ok(store)
    }
}

impl<D: BlockDevice> FileStore<D> {
    pub fn from_parts(blocks: BlockStore<D>, index: BTreeIndex) -> Self {
        let codec = ChainCodec::new(blocks.payload_capacity());
        Self {
            blocks,
            index,
            codec,
        }
    }

    pub fn used_blocks(&self) -> usize {
        self.blocks.used_blocks()
    }

    pub fn free_blocks(&self) -> usize {
        self.blocks.free_blocks()
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            total_blocks: self.blocks.total_blocks(),
            used_blocks: self.blocks.used_blocks(),
            free_blocks: self.blocks.free_blocks(),
            block_size: self.blocks.block_size(),
        }
    }

    /// Writes `record`, creating it or replacing the stored version.
    ///
    /// Blocks of an existing chain are rewritten in place, missing ones are
    /// allocated and surplus ones freed. All allocation happens before any
    /// block is written: on `DiskFull` the blocks taken by this call are
    /// released and the stored version is left untouched.
    pub fn save(&mut self, record: &FileRecord) -> Result<()> {
        let file_id = record.file_id;
        let existing = match self.index.search(file_id)? {
            Some(entry) => match self.chain_blocks(file_id, entry.first_block) {
                Ok(chain) => chain,
                Err(StoreError::CorruptChain { reason, .. }) => {
                    warn!(
                        "Existing chain of file {} unreadable ({}), writing a new one.",
                        file_id, reason
                    );
                    Vec::new()
                }
                Err(e) => return Err(e),
            },
            None => Vec::new(),
        };

        let blob = record.serialize()?;
        let slices = self.codec.split(&blob);
        let needed = slices.len();

        let reused = existing.len().min(needed);
        let mut chain: Vec<BlockNumber> = existing[..reused].to_vec();
        let mut fresh = Vec::with_capacity(needed - reused);
        for _ in reused..needed {
            match self.blocks.allocate_block() {
                Ok(b) => fresh.push(b),
                Err(e) => {
                    warn!(
                        "Saving file {} needs {} blocks, only {} free.",
                        file_id,
                        needed - reused,
                        fresh.len()
                    );
                    self.release(&fresh);
                    return Err(e);
                }
            }
        }
        chain.extend_from_slice(&fresh);

        for (pos, slice) in slices.iter().enumerate() {
            let next = chain
                .get(pos + 1)
                .map(|&b| b as i32)
                .unwrap_or(END_OF_CHAIN);
            let header = BlockHeader::new(file_id, slice.sequence_index as i32, next);
            if let Err(e) = self.blocks.write_block(chain[pos], &header, slice.payload) {
                error!("Writing block {} of file {} failed: {}", chain[pos], file_id, e);
                self.release(&fresh);
                return Err(e);
            }
        }

        if let Err(e) = self.index.insert(file_id, chain[0] as i32) {
            self.release(&fresh);
            return Err(e);
        }
        for &surplus in &existing[reused..] {
            self.blocks.free_block(surplus)?;
        }
        self.blocks.save_bitmap()?;

        debug!(
            "Saved file {} ({} bytes) in {} blocks: {} reused, {} new, {} freed.",
            file_id,
            blob.len(),
            needed,
            reused,
            fresh.len(),
            existing.len() - reused
        );
        Ok(())
    }

    /// Same as `save`, for records known to exist already.
    pub fn update(&mut self, record: &FileRecord) -> Result<()> {
        self.save(record)
    }

    /// Reads the record stored for `file_id`.
    pub fn load(&mut self, file_id: i32) -> Result<Option<FileRecord>> {
        let entry = match self.index.search(file_id)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let payloads = self.walk_chain(file_id, entry.first_block)?;
        let blob = self.codec.reassemble(payloads.iter().map(|(_, p)| p));
        let record = FileRecord::parse(&blob)?;
        if record.file_id != file_id {
            return Err(StoreError::corrupt_chain(
                file_id,
                format!("chain holds record of file {}", record.file_id),
            ));
        }
        Ok(Some(record))
    }

    /// Frees the chain of `file_id` and removes it from the index. Returns
    /// false if the id is not stored. An index entry whose chain is no longer
    /// readable is still removed.
    pub fn delete(&mut self, file_id: i32) -> Result<bool> {
        let entry = match self.index.search(file_id)? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        match self.chain_blocks(file_id, entry.first_block) {
            Ok(chain) => {
                for b in chain {
                    self.blocks.free_block(b)?;
                }
            }
            Err(StoreError::CorruptChain { reason, .. }) => {
                warn!(
                    "File {} has no readable chain ({}), dropping its index entry.",
                    file_id, reason
                );
            }
            Err(e) => return Err(e),
        }
        self.index.remove(file_id)?;
        self.blocks.save_bitmap()?;
        debug!("Deleted file {}.", file_id);
        Ok(true)
    }

    /// Ids of every stored record.
    pub fn enumerate_ids(&mut self) -> Result<BTreeSet<i32>> {
        Ok(self.index.enumerate()?.into_iter().collect())
    }

    /// Loads every readable record owned by `owner_id`. Records that fail to
    /// load are skipped with a warning.
    pub fn load_owned(&mut self, owner_id: i32) -> Result<Vec<FileRecord>> {
        let mut owned = Vec::new();
        for file_id in self.index.enumerate()? {
            match self.load(file_id) {
                Ok(Some(record)) if record.owner_id == owner_id => owned.push(record),
                Ok(_) => {}
                Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
                Err(e) => warn!("Skipping unreadable file {}: {}", file_id, e),
            }
        }
        info!("Loaded {} files for owner {}.", owned.len(), owner_id);
        Ok(owned)
    }

    /// Moves every stored record that expired before `now` into the bin.
    /// Returns the ids that were moved.
    pub fn move_expired_to_bin(&mut self, now: i64) -> Result<Vec<i32>> {
        let mut moved = Vec::new();
        for file_id in self.index.enumerate()? {
            let mut record = match self.load(file_id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
                Err(e) => {
                    warn!("Skipping unreadable file {} during expiry: {}", file_id, e);
                    continue;
                }
            };
            if record.in_bin || !record.is_expired(now) {
                continue;
            }
            record.in_bin = true;
            self.update(&record)?;
            moved.push(file_id);
        }
        if !moved.is_empty() {
            info!("Moved {} expired files to the bin.", moved.len());
        }
        Ok(moved)
    }

    /// Flushes blocks, bitmap and index to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.blocks.sync()?;
        self.index.sync()
    }

    fn chain_blocks(&mut self, file_id: i32, first_block: i32) -> Result<Vec<BlockNumber>> {
        Ok(self
            .walk_chain(file_id, first_block)?
            .into_iter()
            .map(|(b, _)| b)
            .collect())
    }

    /// Follows the chain starting at `first_block`, returning each block with
    /// its payload. Every block must be allocated, owned by `file_id` and carry
    /// the expected sequence index. A revisited block fails the sequence check,
    /// except when the loop spans every block of the store: the length bound
    /// catches that one.
    fn walk_chain(&mut self, file_id: i32, first_block: i32) -> Result<Vec<(BlockNumber, Vec<u8>)>> {
        let total = self.blocks.total_blocks();
        let mut chain = Vec::new();
        let mut next = first_block;
        while next != END_OF_CHAIN {
            if chain.len() >= total {
                return Err(StoreError::corrupt_chain(
                    file_id,
                    format!("chain longer than the {} blocks in the store", total),
                ));
            }
            let blocknr = match self.blocks.check_range(next as i64) {
                Ok(b) => b,
                Err(_) => {
                    return Err(StoreError::corrupt_chain(
                        file_id,
                        format!("pointer to block {} out of range", next),
                    ))
                }
            };
            if !self.blocks.is_used(blocknr) {
                return Err(StoreError::corrupt_chain(
                    file_id,
                    format!("pointer to unallocated block {}", blocknr),
                ));
            }
            let (header, payload) = self.blocks.read_block(blocknr)?;
            if header.owner_file_id != file_id || header.sequence_index as usize != chain.len() {
                return Err(StoreError::corrupt_chain(
                    file_id,
                    format!(
                        "block {} belongs to file {} at position {}",
                        blocknr, header.owner_file_id, header.sequence_index
                    ),
                ));
            }
            next = header.next_block;
            chain.push((blocknr, payload));
        }
        if chain.is_empty() {
            return Err(StoreError::corrupt_chain(file_id, "index entry has no first block"));
        }
        Ok(chain)
    }

    /// Returns blocks taken by a failed write to the free pool.
    fn release(&mut self, blocks: &[BlockNumber]) {
        for &b in blocks {
            if let Err(e) = self.blocks.free_block(b) {
                error!("Could not release block {}: {}", b, e);
            }
        }
    }
}

impl<D: BlockDevice> Drop for FileStore<D> {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!("Failed to sync file store on close: {}", e);
        }
    }
}
