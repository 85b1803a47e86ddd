use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// No free block is left in the backing store. Recoverable: the write was
    /// rolled back and can be retried once space is released.
    #[error("no free block available")]
    DiskFull,
    #[error("block {block} out of range (total blocks: {total})")]
    BlockOutOfRange { block: i64, total: usize },
    #[error("payload of {size} bytes exceeds block capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },
    #[error("corrupt block chain for file {file_id}: {reason}")]
    CorruptChain { file_id: i32, reason: String },
    #[error("index corruption: {0}")]
    IndexCorruption(String),
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("store lock poisoned by a panicking holder")]
    Poisoned,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corrupt_chain(file_id: i32, reason: impl Into<String>) -> Self {
        StoreError::CorruptChain {
            file_id,
            reason: reason.into(),
        }
    }
}
