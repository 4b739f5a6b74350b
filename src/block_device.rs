use super::*;

use std::any::Any;

/// Whole-block storage. `buf` is always exactly one block long.
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, blockno: usize, buf: &[u8]) -> Result<()>;
    fn block_size(&self) -> usize;
    fn num_blocks(&self) -> usize;
}
