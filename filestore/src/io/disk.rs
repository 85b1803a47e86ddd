use crate::io::{BlockDevice, BlockNumber};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

/// Block storage over a single regular file. Block `n` lives at byte offset
/// `n * block_size`.
pub struct FileBlockDevice {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    block_size: usize,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockDevice {
    /// Opens the block file at `path`, creating and zero-sizing it to
    /// `block_count * block_size` bytes when it does not exist yet. Existing
    /// contents are preserved.
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        block_count: usize,
    ) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        FileBlockDeviceBuilder::from(file)
            .with_block_size(block_size)
            .with_block_count(block_count)
            .clear_medium(false)
            .build()
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < self.block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_size) as u64))?;
        self.fd.read_exact(&mut buf[..self.block_size])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * self.block_size) as u64))?;

        let max = buf.len().min(self.block_size);
        self.fd.write_all(&buf[..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }
}

pub struct FileBlockDeviceBuilder {
    fd: File,
    block_size: usize,
    block_count: usize,
    clear: bool,
}

impl From<File> for FileBlockDeviceBuilder {
    fn from(fd: File) -> Self {
        FileBlockDeviceBuilder {
            fd,
            block_size: crate::config::DEFAULT_BLOCK_SIZE,
            block_count: 0,
            clear: true,
        }
    }
}

impl FileBlockDeviceBuilder {
    /// Sets the size in bytes of every block.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether existing file contents are discarded. Defaults to true.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// Takes ownership of the file and sizes it to hold every block. With
    /// `clear_medium(true)` all blocks read back as zeros afterwards, otherwise
    /// only bytes past the previous end of file are zero.
    pub fn build(self) -> std::io::Result<FileBlockDevice> {
        if self.block_count == 0 || self.block_size == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block device needs a non-zero geometry",
            ));
        }
        let total_bytes = (self.block_count * self.block_size) as u64;
        if self.clear {
            self.fd.set_len(0)?;
            self.fd.set_len(total_bytes)?;
        } else if self.fd.metadata()?.len() < total_bytes {
            self.fd.set_len(total_bytes)?;
        }
        Ok(FileBlockDevice {
            fd: self.fd,
            block_size: self.block_size,
            block_count: self.block_count,
        })
    }
}
