//! Bounded write-back cache of disk blocks with NRU replacement.
//!
//! Entries live in a fixed slot arena; `index` maps a block number to its slot
//! and `free` holds the unused slots. Reclaim scans the arena in slot order and
//! evicts one entry from the lowest non-empty class:
//!   0 invalid
//!   1 not referenced, not modified
//!   2 not referenced, modified
//!   3 referenced, not modified
//!   4 referenced, modified

use super::*;
use block_device::BlockDevice;

use log::{debug, error};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct CacheEntry {
    blockno: usize,
    /// content still matches what the block number refers to
    valid: bool,
    /// touched since the last aging pass
    referenced: bool,
    /// differs from the disk, write back before dropping
    modified: bool,
    /// simulated time units spent in the cache
    age: u32,
    data: Box<Block>,
}

impl CacheEntry {
    fn class(&self) -> u8 {
        if !self.valid {
            return 0;
        }
        match (self.referenced, self.modified) {
            (false, false) => 1,
            (false, true) => 2,
            (true, false) => 3,
            (true, true) => 4,
        }
    }

    fn state(&self) -> EntryState {
        EntryState {
            valid: self.valid,
            referenced: self.referenced,
            modified: self.modified,
            age: self.age,
        }
    }
}

/// Flags of one cached block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryState {
    pub valid: bool,
    pub referenced: bool,
    pub modified: bool,
    pub age: u32,
}

struct CacheTable {
    slots: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    index: HashMap<usize /* blockno */, usize /* slot */>,
}

impl CacheTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            // pop() hands out the lowest slot first
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn get_mut(&mut self, blockno: usize) -> Option<&mut CacheEntry> {
        let slot = *self.index.get(&blockno)?;
        self.slots[slot].as_mut()
    }

    fn entries(&self) -> impl Iterator<Item = (usize, &CacheEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e)))
    }
}

pub struct BlockCache {
    capacity: usize,
    blk_dev: Arc<dyn BlockDevice>,
    table: Mutex<CacheTable>,
}

impl BlockCache {
    pub fn new(capacity: usize, blk_dev: Arc<dyn BlockDevice>) -> Result<Self> {
        if capacity == 0 {
            return Err(FsError::InvalidArgument(
                "cache capacity must be > 0".to_owned(),
            ));
        }
        if blk_dev.block_size() != BSIZE {
            return Err(FsError::InvalidArgument(format!(
                "cache holds {BSIZE} byte blocks, device has {} byte blocks",
                blk_dev.block_size()
            )));
        }
        Ok(Self {
            capacity,
            blk_dev,
            table: Mutex::new(CacheTable::new(capacity)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, blockno: usize) -> bool {
        self.lock().index.contains_key(&blockno)
    }

    pub fn entry_state(&self, blockno: usize) -> Option<EntryState> {
        self.lock().get_mut(blockno).map(|e| e.state())
    }

    /// Returns the block, loading it from the device on a miss.
    pub fn read(&self, blockno: usize) -> Result<Block> {
        let mut table = self.lock();
        if let Some(entry) = table.get_mut(blockno) {
            if entry.valid {
                entry.referenced = true;
                debug!("cache: hit {blockno}");
                return Ok(*entry.data);
            }
            // stale, the block moved underneath us
            self.remove(&mut table, blockno)?;
        }

        debug!("cache: miss {blockno}");
        let mut data = Box::new([0u8; BSIZE]);
        self.blk_dev.read_block(blockno, data.as_mut_slice())?;
        let block = *data;
        self.insert(&mut table, blockno, data, false)?;
        Ok(block)
    }

    /// Replaces the whole block. Reaches the device on eviction or flush.
    pub fn write(&self, blockno: usize, block: &Block) -> Result<()> {
        let mut table = self.lock();
        if let Some(entry) = table.get_mut(blockno) {
            if entry.valid {
                entry.data.copy_from_slice(block);
                entry.referenced = true;
                entry.modified = true;
                return Ok(());
            }
            self.remove(&mut table, blockno)?;
        }
        self.insert(&mut table, blockno, Box::new(*block), true)
    }

    /// Marks the entry stale so the next access reloads it. Returns whether it was cached.
    pub fn invalidate(&self, blockno: usize) -> bool {
        match self.lock().get_mut(blockno) {
            Some(entry) => {
                entry.valid = false;
                true
            }
            None => false,
        }
    }

    /// Writes the entry back if needed and drops it. Returns whether it was cached.
    pub fn evict(&self, blockno: usize) -> Result<bool> {
        let mut table = self.lock();
        if !table.index.contains_key(&blockno) {
            return Ok(false);
        }
        self.remove(&mut table, blockno)?;
        Ok(true)
    }

    /// The block was freed: forget the cached copy and zero it on the device.
    pub fn discard(&self, blockno: usize) -> Result<()> {
        let mut table = self.lock();
        if let Some(entry) = table.get_mut(blockno) {
            entry.valid = false;
        }
        self.blk_dev.write_block(blockno, &[0u8; BSIZE])
    }

    /// One pass of the aging task: every entry gets older by `interval` and
    /// loses its referenced bit; entries reaching `MAX_AGE` are written back
    /// and dropped. Returns the number dropped.
    pub fn age_tick(&self, interval: u32) -> Result<usize> {
        let mut table = self.lock();
        let mut expired = Vec::new();
        for entry in table.slots.iter_mut().flatten() {
            entry.age += interval;
            entry.referenced = false;
            if entry.age >= MAX_AGE {
                expired.push(entry.blockno);
            }
        }
        for &blockno in &expired {
            self.remove(&mut table, blockno)?;
        }
        if !expired.is_empty() {
            debug!("cache: aged out {expired:?}");
        }
        Ok(expired.len())
    }

    /// Frees one slot. Returns the evicted block number, if any entry existed.
    pub fn reclaim(&self) -> Result<Option<usize>> {
        let mut table = self.lock();
        self.reclaim_locked(&mut table)
    }

    fn reclaim_locked(&self, table: &mut CacheTable) -> Result<Option<usize>> {
        let victim = table
            .entries()
            .min_by_key(|(slot, entry)| (entry.class(), *slot))
            .map(|(_, entry)| (entry.blockno, entry.class()));
        match victim {
            Some((blockno, class)) => {
                debug!("cache: reclaim {blockno} (class {class})");
                self.remove(table, blockno)?;
                Ok(Some(blockno))
            }
            None => Ok(None),
        }
    }

    /// Writes back every valid modified entry, keeping it cached. Returns the number written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut table = self.lock();
        let mut written = 0;
        for entry in table.slots.iter_mut().flatten() {
            if entry.valid && entry.modified {
                self.blk_dev.write_block(entry.blockno, entry.data.as_slice())?;
                entry.modified = false;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Drops every entry without writing anything back.
    pub fn clear(&self) {
        let mut table = self.lock();
        *table = CacheTable::new(self.capacity);
    }

    fn insert(
        &self,
        table: &mut CacheTable,
        blockno: usize,
        data: Box<Block>,
        modified: bool,
    ) -> Result<()> {
        if table.free.is_empty() {
            self.reclaim_locked(table)?;
        }
        let Some(slot) = table.free.pop() else {
            error!("cache: no slot after reclaim");
            return Err(FsError::NoSpace("cache slots"));
        };
        table.slots[slot] = Some(CacheEntry {
            blockno,
            valid: true,
            referenced: true,
            modified,
            age: 0,
            data,
        });
        table.index.insert(blockno, slot);
        Ok(())
    }

    fn remove(&self, table: &mut CacheTable, blockno: usize) -> Result<()> {
        let Some(&slot) = table.index.get(&blockno) else {
            return Ok(());
        };
        if let Some(entry) = table.slots[slot].as_ref() {
            if entry.valid && entry.modified {
                debug!("cache: write back {blockno}");
                self.blk_dev.write_block(blockno, entry.data.as_slice())?;
            }
        }
        table.slots[slot] = None;
        table.index.remove(&blockno);
        table.free.push(slot);
        Ok(())
    }

    pub fn dump(&self) -> String {
        let table = self.lock();
        let mut out = String::from("===== Dump: Cache of Blocks Entries =======================\n");
        for (_, entry) in table.entries() {
            let _ = writeln!(out, "Entry_N: {}", entry.blockno);
            let _ = writeln!(out, "V: {}", u8::from(entry.valid));
            let _ = writeln!(
                out,
                "R: {} M: {}",
                u8::from(entry.referenced),
                u8::from(entry.modified)
            );
            out.push_str("Blk_Cnt: ");
            for byte in entry.data.iter() {
                let _ = write!(out, "{byte:x}:");
            }
            out.push('\n');
        }
        out.push_str("************************************************************\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk::BlockStore;

    fn setup(capacity: usize) -> (Arc<BlockStore>, BlockCache) {
        let disk = Arc::new(BlockStore::new(32, BSIZE).expect("disk"));
        let cache = BlockCache::new(capacity, disk.clone()).expect("cache");
        (disk, cache)
    }

    fn on_disk(disk: &BlockStore, blockno: usize) -> Block {
        let mut buf = [0u8; BSIZE];
        disk.read_block(blockno, &mut buf).expect("read disk");
        buf
    }

    #[test]
    fn read_your_write_before_flush() {
        let (disk, cache) = setup(4);
        cache.write(12, &[7u8; BSIZE]).expect("write");
        assert_eq!(cache.read(12).expect("read"), [7u8; BSIZE]);
        assert_eq!(on_disk(&disk, 12), [0u8; BSIZE]);

        let state = cache.entry_state(12).expect("cached");
        assert!(state.valid && state.referenced && state.modified);
    }

    #[test]
    fn miss_loads_clean_entry() {
        let (disk, cache) = setup(4);
        disk.write_block(5, &[3u8; BSIZE]).expect("write disk");
        assert_eq!(cache.read(5).expect("read"), [3u8; BSIZE]);
        let state = cache.entry_state(5).expect("cached");
        assert!(state.valid && state.referenced && !state.modified);
        assert_eq!(state.age, 0);
    }

    #[test]
    fn reclaim_follows_nru_classes() {
        let (disk, cache) = setup(4);
        cache.read(10).expect("read");
        cache.write(11, &[11u8; BSIZE]).expect("write");
        cache.age_tick(0).expect("tick");
        // 10: not referenced, clean. 11: not referenced, dirty.
        cache.read(12).expect("read");
        cache.write(13, &[13u8; BSIZE]).expect("write");
        assert_eq!(cache.len(), 4);

        cache.read(14).expect("read");
        assert!(!cache.contains(10));
        assert_eq!(cache.len(), 4);

        cache.read(15).expect("read");
        assert!(!cache.contains(11));
        assert_eq!(on_disk(&disk, 11), [11u8; BSIZE]);

        // referenced+modified 13 goes first once invalid, and is not written back
        assert!(cache.invalidate(13));
        cache.read(16).expect("read");
        assert!(!cache.contains(13));
        assert_eq!(on_disk(&disk, 13), [0u8; BSIZE]);
        assert!(cache.contains(12) && cache.contains(14) && cache.contains(15));
    }

    #[test]
    fn referenced_dirty_entry_outlives_every_other_class() {
        let (_disk, cache) = setup(3);
        cache.write(20, &[1u8; BSIZE]).expect("write");
        cache.read(21).expect("read");
        cache.read(22).expect("read");
        for blockno in 23..28 {
            cache.read(blockno).expect("read");
            assert!(cache.contains(20), "dirty+referenced evicted at {blockno}");
            cache.write(20, &[1u8; BSIZE]).expect("touch");
        }
    }

    #[test]
    fn reclaim_on_empty_cache_is_none() {
        let (_disk, cache) = setup(2);
        assert_eq!(cache.reclaim().expect("reclaim"), None);
    }

    #[test]
    fn aging_writes_back_and_drops_old_entries() {
        let (disk, cache) = setup(4);
        cache.write(10, &[9u8; BSIZE]).expect("write");
        for _ in 0..4 {
            assert_eq!(cache.age_tick(AGE_INTERVAL).expect("tick"), 0);
        }
        let state = cache.entry_state(10).expect("still cached");
        assert_eq!(state.age, 8);
        assert!(!state.referenced);
        assert_eq!(on_disk(&disk, 10), [0u8; BSIZE]);

        assert_eq!(cache.age_tick(AGE_INTERVAL).expect("tick"), 1);
        assert!(!cache.contains(10));
        assert_eq!(on_disk(&disk, 10), [9u8; BSIZE]);
    }

    #[test]
    fn invalidated_entry_reloads() {
        let (disk, cache) = setup(4);
        assert_eq!(cache.read(6).expect("read"), [0u8; BSIZE]);
        disk.write_block(6, &[4u8; BSIZE]).expect("write disk");
        assert_eq!(cache.read(6).expect("read"), [0u8; BSIZE]);

        assert!(cache.invalidate(6));
        assert!(!cache.entry_state(6).expect("cached").valid);
        assert_eq!(cache.read(6).expect("read"), [4u8; BSIZE]);
        assert!(cache.entry_state(6).expect("cached").valid);
        assert!(!cache.invalidate(7));
    }

    #[test]
    fn write_over_invalid_entry_replaces_it() {
        let (_disk, cache) = setup(2);
        cache.write(8, &[1u8; BSIZE]).expect("write");
        cache.invalidate(8);
        cache.write(8, &[2u8; BSIZE]).expect("write");
        let state = cache.entry_state(8).expect("cached");
        assert!(state.valid && state.modified);
        assert_eq!(cache.read(8).expect("read"), [2u8; BSIZE]);
    }

    #[test]
    fn evict_and_flush() {
        let (disk, cache) = setup(4);
        cache.write(3, &[5u8; BSIZE]).expect("write");
        cache.write(4, &[6u8; BSIZE]).expect("write");

        assert_eq!(cache.flush_all().expect("flush"), 2);
        assert_eq!(on_disk(&disk, 4), [6u8; BSIZE]);
        assert!(!cache.entry_state(4).expect("cached").modified);

        cache.write(3, &[8u8; BSIZE]).expect("write");
        assert!(cache.evict(3).expect("evict"));
        assert!(!cache.contains(3));
        assert_eq!(on_disk(&disk, 3), [8u8; BSIZE]);
        assert!(!cache.evict(3).expect("evict"));
    }

    #[test]
    fn discard_zeroes_the_block() {
        let (disk, cache) = setup(4);
        cache.write(9, &[1u8; BSIZE]).expect("write");
        cache.flush_all().expect("flush");
        cache.discard(9).expect("discard");
        assert_eq!(on_disk(&disk, 9), [0u8; BSIZE]);
        assert_eq!(cache.read(9).expect("read"), [0u8; BSIZE]);
    }

    #[test]
    fn dump_format() {
        let (_disk, cache) = setup(2);
        let mut block = [0u8; BSIZE];
        block[0] = 0xab;
        cache.write(17, &block).expect("write");

        let dump = cache.dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(
            lines[0],
            "===== Dump: Cache of Blocks Entries ======================="
        );
        assert_eq!(lines[1], "Entry_N: 17");
        assert_eq!(lines[2], "V: 1");
        assert_eq!(lines[3], "R: 1 M: 1");
        assert!(lines[4].starts_with("Blk_Cnt: ab:0:0:"));
        assert_eq!(
            lines[5],
            "************************************************************"
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let disk = Arc::new(BlockStore::new(4, BSIZE).expect("disk"));
        assert!(matches!(
            BlockCache::new(0, disk),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
