//! A small persistent file store.
//!
//! Files are serialized into chains of fixed-size blocks inside a single
//! backing file, block occupancy is tracked by a persisted bitmap, and a
//! disk-resident B-tree maps each file id to the first block of its chain.
//!
//! ```no_run
//! use filestore::{FileRecord, FileStore, StoreConfig};
//!
//! let config = StoreConfig::new("/var/lib/files").total_blocks(1024);
//! let mut store = FileStore::open(&config)?;
//! store.save(&FileRecord::new(1, 100, "hello.txt", b"hello".to_vec()))?;
//! let record = store.load(1)?;
//! # Ok::<(), filestore::StoreError>(())
//! ```

pub mod alloc;
pub mod block;
pub mod chain;
pub mod config;
pub mod error;
pub mod handle;
pub mod index;
pub mod io;
pub mod record;
mod store;

pub use crate::config::StoreConfig;
pub use crate::error::{Result, StoreError};
pub use crate::handle::{ExpirySweeper, StoreHandle};
pub use crate::record::FileRecord;
pub use crate::store::{DiskStats, FileStore};
