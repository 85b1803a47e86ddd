mod block;
mod disk;

pub use block::{BlockDevice, BlockNumber};
pub use disk::{FileBlockDevice, FileBlockDeviceBuilder};
