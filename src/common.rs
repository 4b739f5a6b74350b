//! Disk layout:
//! [ block bitmap | inode bitmap | inode table(8) | data blocks ... ]
//! block 0 is the free-block bitmap, block 1 the free-inode bitmap,
//! blocks 2-9 hold the inode table, data starts at block 10.

/// inode number
pub type InodeId = u16;

/// one block worth of bytes
pub type Block = [u8; BSIZE];

/// root i-number
pub const ROOTINO: InodeId = 1;

/// block size
pub const BSIZE: usize = 512;

/// direct blocks in inode
pub const NDIRECT: usize = 10;

/// spare u32 slots kept after the direct blocks, never used
pub const NRESERVED: usize = 4;

/// max size of a file in bytes, there is no indirection
pub const MAXFILE: usize = NDIRECT * BSIZE;

/// on-disk inode size
pub const INODE_SZ: usize = 64;

/// inodes per block
pub const IPB: usize = BSIZE / INODE_SZ;

/// Directory is a file containing a sequence of dirent structures.
/// 13 chars + '\0'
pub const DIRSIZ: usize = 14;

/// on-disk dirent size
pub const DIRENT_SZ: usize = 16;

/// dirents per block
pub const DPB: usize = BSIZE / DIRENT_SZ;

/// bitmap per block
pub const BPB: usize = BSIZE * 8;

pub const BBITMAP_BLOCK: usize = 0;
pub const IBITMAP_BLOCK: usize = 1;
pub const ITAB_START: usize = 2;

/// blocks of the inode table
pub const ITAB_BLOCKS: usize = 8;

/// size of the inode table
pub const NINODES: usize = ITAB_BLOCKS * IPB;

/// first data block
pub const DATA_START: usize = ITAB_START + ITAB_BLOCKS;

/// default number of cached blocks
pub const NCACHE: usize = 8;

/// simulated time units between two aging passes
pub const AGE_INTERVAL: u32 = 2;

/// an entry this old is written back and dropped
pub const MAX_AGE: u32 = 10;

/// number of blocks needed to hold `size` bytes
pub fn blocks_for(size: usize) -> usize {
    size.div_ceil(BSIZE)
}
