mod ager; // background cache aging
mod bitmap;
mod block_cache; // NRU write-back cache of file blocks
mod block_device;
mod common;
mod defrag;
mod dir; // namespace
mod disk; // in-memory disk
mod error;
mod fs; // file system
mod gate;
mod inode;
mod usage; // diagnostics

pub use block_cache::{BlockCache, EntryState};
pub use block_device::BlockDevice;
pub use common::*;
pub use disk::BlockStore;
pub use error::{status_of, FsError, ResStatus, Result};
pub use fs::{FileSystem, FsConfig};
pub use inode::{FileAttrs, FileKind, FileName};
pub use usage::BlockUsage;
