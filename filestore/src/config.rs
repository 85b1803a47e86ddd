use std::path::PathBuf;

use crate::block::BLOCK_HEADER_SIZE;
use crate::error::{Result, StoreError};

/// 50k blocks, the unit every stored record is chained through.
pub const DEFAULT_BLOCK_SIZE: usize = 50 * 1024;
/// A 2 GiB backing store split into `DEFAULT_BLOCK_SIZE` blocks.
pub const DEFAULT_TOTAL_BLOCKS: usize = (2 * 1024 * 1024 * 1024) / DEFAULT_BLOCK_SIZE;
pub const DEFAULT_MIN_DEGREE: usize = 3;

/// Location and geometry of a file store.
///
/// All three backing files live in `dir`. Geometry (`block_size`,
/// `total_blocks`, `min_degree`) is not recorded on disk, so a store must be
/// reopened with the same values it was created with.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the backing files.
    pub dir: PathBuf,
    /// Size in bytes of a single block, header included.
    pub block_size: usize,
    /// Number of blocks in the block store file.
    pub total_blocks: usize,
    /// Minimum degree `t` of the index B-tree.
    pub min_degree: usize,
    pub disk_file: String,
    pub bitmap_file: String,
    pub index_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./filestore"),
            block_size: DEFAULT_BLOCK_SIZE,
            total_blocks: DEFAULT_TOTAL_BLOCKS,
            min_degree: DEFAULT_MIN_DEGREE,
            disk_file: "disk.dat".to_string(),
            bitmap_file: "bitmap.dat".to_string(),
            index_file: "btree.dat".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn total_blocks(mut self, blocks: usize) -> Self {
        self.total_blocks = blocks;
        self
    }

    pub fn min_degree(mut self, t: usize) -> Self {
        self.min_degree = t;
        self
    }

    pub fn disk_file(mut self, name: impl Into<String>) -> Self {
        self.disk_file = name.into();
        self
    }

    pub fn bitmap_file(mut self, name: impl Into<String>) -> Self {
        self.bitmap_file = name.into();
        self
    }

    pub fn index_file(mut self, name: impl Into<String>) -> Self {
        self.index_file = name.into();
        self
    }

    pub fn disk_path(&self) -> PathBuf {
        self.dir.join(&self.disk_file)
    }

    pub fn bitmap_path(&self) -> PathBuf {
        self.dir.join(&self.bitmap_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(&self.index_file)
    }

    /// Bytes of payload a single block can carry.
    pub fn payload_capacity(&self) -> usize {
        self.block_size.saturating_sub(BLOCK_HEADER_SIZE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size <= BLOCK_HEADER_SIZE {
            return Err(StoreError::InvalidConfig(format!(
                "block size {} must exceed the {} byte block header",
                self.block_size, BLOCK_HEADER_SIZE
            )));
        }
        if self.total_blocks == 0 || self.total_blocks > i32::MAX as usize {
            return Err(StoreError::InvalidConfig(format!(
                "total blocks {} must be in 1..={}",
                self.total_blocks,
                i32::MAX
            )));
        }
        if self.min_degree < 2 {
            return Err(StoreError::InvalidConfig(format!(
                "minimum degree {} must be at least 2",
                self.min_degree
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_two_gigabyte_disk() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size, 51200);
        assert_eq!(config.total_blocks, 41943);
        assert_eq!(config.min_degree, 3);
        assert_eq!(config.payload_capacity(), 51184);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides_paths_and_geometry() {
        let config = StoreConfig::new("/tmp/store")
            .block_size(128)
            .total_blocks(16)
            .min_degree(2)
            .index_file("index.bin");

        assert_eq!(config.index_path(), PathBuf::from("/tmp/store/index.bin"));
        assert_eq!(config.disk_path(), PathBuf::from("/tmp/store/disk.dat"));
        assert_eq!(config.payload_capacity(), 112);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_impossible_geometry() {
        assert!(StoreConfig::default().block_size(16).validate().is_err());
        assert!(StoreConfig::default().total_blocks(0).validate().is_err());
        assert!(StoreConfig::default().min_degree(1).validate().is_err());
    }
}
