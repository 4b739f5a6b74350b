//! Compaction of the data region.
//!
//! Inodes are walked in id order and their blocks in slot order; the n-th block
//! met lands on block `DATA_START + n`. If that target is taken, its occupant is
//! first parked on the highest free block.

use super::*;
use fs::{FileSystem, FsMeta};

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// Clears the in-progress flag when defrag returns.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FileSystem {
    /// Compacts in-use data blocks to the lowest block numbers. Returns the number of moves.
    pub fn defrag(&self) -> Result<usize> {
        if self
            .defragging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("defrag: already running");
            return Err(FsError::Busy);
        }
        let _running = Running(&self.defragging);

        let mut meta = self.meta.write();
        let num_blocks = self.num_blocks();
        if !(DATA_START..num_blocks).any(|bno| meta.blk_bmap.is_set(bno)) {
            return Err(FsError::Unavailable);
        }
        meta.free_block()?;

        // relocation copies on the disk, so it has to be current
        self.cache.flush_all()?;

        let mut target = DATA_START;
        let mut moves = 0;
        for ino in ROOTINO as usize..NINODES {
            if !meta.inode_bmap.is_set(ino) {
                continue;
            }
            for slot in 0..meta.inodes[ino].nblocks() {
                let bno = meta.inodes[ino].addrs[slot] as usize;
                if bno < target {
                    // already placed, a block shared by an earlier slot
                    continue;
                }
                if bno > target {
                    moves += self.relocate(&mut meta, bno, target)?;
                }
                target += 1;
            }
        }

        self.store_meta(&meta)?;
        info!("defrag: {moves} moves, data now ends at block {target}");
        Ok(moves)
    }

    /// Moves `from` onto `to`, parking whatever sits on `to` first.
    fn relocate(&self, meta: &mut FsMeta, from: usize, to: usize) -> Result<usize> {
        let mut moves = 0;
        if meta.blk_bmap.is_set(to) {
            let spare = meta
                .blk_bmap
                .find_free_rev(DATA_START)
                .ok_or(FsError::NoSpace("blocks"))?;
            self.move_block(meta, to, spare)?;
            moves += 1;
        }
        self.move_block(meta, from, to)?;
        Ok(moves + 1)
    }

    /// `to` must be free.
    fn move_block(&self, meta: &mut FsMeta, from: usize, to: usize) -> Result<()> {
        let mut block = [0u8; BSIZE];
        self.store.read_block(from, &mut block)?;
        self.store.write_block(to, &block)?;
        self.store.write_block(from, &[0u8; BSIZE])?;

        // cached copies refer to the old locations
        self.cache.invalidate(from);
        self.cache.invalidate(to);

        meta.blk_bmap.set(to);
        meta.refs[to] = meta.refs[from];
        meta.refs[from] = 0;
        meta.blk_bmap.clear(from);
        for inode in meta.inodes.iter_mut() {
            let n = inode.nblocks();
            for addr in inode.addrs[..n].iter_mut().filter(|addr| **addr as usize == from) {
                *addr = to as u32;
            }
        }
        debug!("defrag: block {from} -> {to}");
        Ok(())
    }
}
