use super::*;
use ager::CacheAger;
use bitmap::BitMap;
use block_cache::BlockCache;
use block_device::BlockDevice;
use disk::BlockStore;
use gate::Gate;
use inode::{check_name, decode_itab, encode_itab, DInode, FileAttrs, FileKind};

use log::{debug, info, warn};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct FsConfig {
    /// # of blocks the data cache holds
    pub cache_capacity: usize,
    /// simulated time units between two aging passes
    pub age_interval: u32,
    /// wall-clock length of one simulated time unit
    pub time_unit: Duration,
    /// slept on every disk block access
    pub io_delay: Duration,
    /// run the aging task in the background
    pub background_aging: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: NCACHE,
            age_interval: AGE_INTERVAL,
            time_unit: Duration::from_millis(100),
            io_delay: Duration::ZERO,
            background_aging: true,
        }
    }
}

/// blocks 0-9 in memory, plus the per-block reference counts
pub(crate) struct FsMeta {
    pub(crate) blk_bmap: BitMap,
    pub(crate) inode_bmap: BitMap,
    pub(crate) inodes: Vec<DInode>,
    /// # of direct-block slots naming each block
    pub(crate) refs: Vec<u32>,
}

impl FsMeta {
    fn check_id(ino: InodeId) -> Result<usize> {
        let ino = ino as usize;
        if ino == 0 || ino >= NINODES {
            return Err(FsError::InvalidArgument(format!("inode {ino} out of range")));
        }
        Ok(ino)
    }

    /// The inode, if it is in use.
    pub(crate) fn used(&self, ino: InodeId) -> Result<&DInode> {
        let idx = Self::check_id(ino)?;
        if !self.inode_bmap.is_set(idx) {
            return Err(FsError::NotFound(format!("inode {ino}")));
        }
        let inode = &self.inodes[idx];
        if inode.kind == FileKind::None {
            panic!("inode {ino} is marked used but is not in the table");
        }
        Ok(inode)
    }

    pub(crate) fn dir(&self, ino: InodeId) -> Result<&DInode> {
        let inode = self.used(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(ino));
        }
        Ok(inode)
    }

    pub(crate) fn file(&self, ino: InodeId) -> Result<&DInode> {
        let inode = self.used(ino)?;
        if !inode.is_file() {
            return Err(FsError::NotAFile(ino));
        }
        Ok(inode)
    }

    pub(crate) fn inode_mut(&mut self, ino: InodeId) -> &mut DInode {
        &mut self.inodes[ino as usize]
    }

    /// Lowest free data block, not yet claimed.
    pub(crate) fn free_block(&self) -> Result<usize> {
        self.blk_bmap
            .find_free_from(DATA_START)
            .ok_or(FsError::NoSpace("blocks"))
    }

    pub(crate) fn free_block_count(&self) -> usize {
        self.blk_bmap.count_free_from(DATA_START)
    }

    /// Marks a free block as owned by one inode.
    pub(crate) fn claim(&mut self, bno: usize) {
        assert_eq!(self.refs[bno], 0, "claiming referenced block {bno}");
        self.blk_bmap.set(bno);
        self.refs[bno] = 1;
    }

    /// Every inode marked used must have a kind, a size its direct blocks can hold
    /// and addresses of allocated data blocks.
    fn check_inodes(&self, num_blocks: usize) -> std::result::Result<(), String> {
        for ino in 1..NINODES {
            if !self.inode_bmap.is_set(ino) {
                continue;
            }
            let inode = &self.inodes[ino];
            if inode.kind == FileKind::None {
                return Err(format!("inode {ino} is marked used but has no kind"));
            }
            if inode.size as usize > MAXFILE {
                return Err(format!("inode {ino} has size {}", inode.size));
            }
            if inode.is_dir() && inode.size as usize % DIRENT_SZ != 0 {
                return Err(format!(
                    "directory inode {ino} has size {}, not whole entries",
                    inode.size
                ));
            }
            for &bno in inode.blocks() {
                let bno = bno as usize;
                if !(DATA_START..num_blocks).contains(&bno) || !self.blk_bmap.is_set(bno) {
                    return Err(format!("inode {ino} names block {bno}"));
                }
            }
        }
        Ok(())
    }

    /// Counts every direct-block slot of every used inode. Metadata blocks count once.
    fn rebuild_refs(&mut self) {
        self.refs.fill(0);
        for bno in 0..DATA_START {
            if self.blk_bmap.is_set(bno) {
                self.refs[bno] = 1;
            }
        }
        for ino in 1..NINODES {
            if !self.inode_bmap.is_set(ino) {
                continue;
            }
            for &bno in self.inodes[ino].blocks() {
                self.refs[bno as usize] += 1;
            }
        }
    }
}

pub struct FileSystem {
    pub(crate) store: Arc<BlockStore>,
    pub(crate) cache: Arc<BlockCache>,
    pub(crate) meta: Gate<FsMeta>,
    pub(crate) defragging: AtomicBool,
    ager: Option<CacheAger>,
}

impl FileSystem {
    /// An unformatted filesystem on a fresh zeroed disk.
    pub fn new(num_blocks: usize, io_delay: Duration) -> Result<Self> {
        Self::with_config(
            num_blocks,
            FsConfig {
                io_delay,
                ..Default::default()
            },
        )
    }

    pub fn with_config(num_blocks: usize, config: FsConfig) -> Result<Self> {
        check_num_blocks(num_blocks).map_err(FsError::InvalidArgument)?;
        let store = BlockStore::new(num_blocks, BSIZE)?;
        Self::assemble(store, config)
    }

    /// Filesystem over a disk image written by `save`.
    pub fn open(path: impl AsRef<Path>, config: FsConfig) -> Result<Self> {
        let path = path.as_ref();
        let store = BlockStore::load(path)?;
        if store.block_size() != BSIZE {
            return Err(FsError::BadImage(format!(
                "{}: block size {} (expected {BSIZE})",
                path.display(),
                store.block_size()
            )));
        }
        check_num_blocks(store.num_blocks()).map_err(FsError::BadImage)?;
        let fs = Self::assemble(store, config)?;
        info!("opened {}", path.display());
        Ok(fs)
    }

    fn assemble(mut store: BlockStore, config: FsConfig) -> Result<Self> {
        store.set_io_delay(config.io_delay);
        let store = Arc::new(store);
        let mut meta = load_meta(&store)?;
        meta.check_inodes(store.num_blocks()).map_err(FsError::BadImage)?;
        meta.rebuild_refs();

        let cache = Arc::new(BlockCache::new(config.cache_capacity, store.clone())?);
        let ager = if config.background_aging {
            Some(CacheAger::spawn(
                cache.clone(),
                config.age_interval,
                config.time_unit,
            )?)
        } else {
            None
        };

        Ok(Self {
            store,
            cache,
            meta: Gate::new(meta),
            defragging: AtomicBool::new(false),
            ager,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.store.num_blocks()
    }

    /// # of free data blocks
    pub fn free_blocks(&self) -> usize {
        self.meta.read().free_block_count()
    }

    /// # of blocks held by the cache, dirty or not
    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Block `bno` as it is on the disk, bypassing the cache. For diagnostics.
    pub fn disk_block(&self, bno: usize) -> Result<Block> {
        let mut block = [0u8; BSIZE];
        self.store.read_block(bno, &mut block)?;
        Ok(block)
    }

    /// Writes back the cache and stores the disk image.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let _meta = self.meta.write();
        self.cache.flush_all()?;
        self.store.store(path)
    }

    pub fn format(&self) -> Result<()> {
        let mut meta = self.meta.write();
        self.cache.clear();
        let zero = [0u8; BSIZE];
        for bno in 0..self.store.num_blocks() {
            self.store.write_block(bno, &zero)?;
        }

        meta.blk_bmap.clear_all();
        meta.inode_bmap.clear_all();
        meta.refs.fill(0);
        meta.inodes.fill(DInode::default());

        // reserve file system meta data blocks
        for bno in 0..DATA_START {
            meta.claim(bno);
        }
        // reserve inodes 0 (will never be used) and 1 (the root)
        meta.inode_bmap.set(0);
        meta.inode_bmap.set(ROOTINO as usize);
        *meta.inode_mut(ROOTINO) = DInode::new(FileKind::Directory);

        self.store_meta(&meta)?;
        info!("formatted {} blocks", self.store.num_blocks());
        Ok(())
    }

    pub fn get_attrs(&self, ino: InodeId) -> Result<FileAttrs> {
        let meta = self.meta.read();
        let inode = meta.used(ino)?;
        Ok(FileAttrs {
            inode: ino,
            kind: inode.kind,
            size: inode.size,
            entries: inode.is_dir().then(|| inode.nentries() as u32),
        })
    }

    /// Up to `count` bytes from `offset`, fewer at end of file.
    pub fn read(&self, ino: InodeId, offset: usize, count: usize) -> Result<Vec<u8>> {
        let meta = self.meta.read();
        self.read_at(&meta, ino, offset, count)
    }

    /// Writes `data` at `offset`, growing the file as needed. Returns the new size.
    pub fn write(&self, ino: InodeId, offset: usize, data: &[u8]) -> Result<u32> {
        let mut meta = self.meta.write();
        self.write_at(&mut meta, ino, offset, data)
    }

    /// Makes `dst_name` in `dst_dir` share the blocks of file `src_name` in `src_dir`.
    /// An existing destination file loses its old content.
    pub fn copy(
        &self,
        src_dir: InodeId,
        src_name: &str,
        dst_dir: InodeId,
        dst_name: &str,
    ) -> Result<InodeId> {
        check_name(src_name)?;
        check_name(dst_name)?;
        let mut meta = self.meta.write();

        meta.dir(src_dir)?;
        let src = self
            .dir_lookup(&meta, src_dir, src_name)?
            .ok_or_else(|| FsError::NotFound(src_name.to_owned()))?;
        meta.file(src)?;
        meta.dir(dst_dir)?;

        let dst = match self.dir_lookup(&meta, dst_dir, dst_name)? {
            Some(dst) if dst == src => return Ok(src),
            Some(dst) => {
                meta.file(dst)?;
                let old = meta.used(dst)?.blocks().to_vec();
                for bno in old {
                    self.release_block(&mut meta, FileKind::File, bno as usize)?;
                }
                dst
            }
            None => self.create_in(&mut meta, dst_dir, dst_name, FileKind::File)?,
        };

        let source = meta.used(src)?.clone();
        for &bno in source.blocks() {
            meta.refs[bno as usize] += 1;
        }
        let target = meta.inode_mut(dst);
        target.addrs = [0; NDIRECT];
        target.addrs[..source.nblocks()].copy_from_slice(source.blocks());
        target.size = source.size;

        self.store_meta(&meta)?;
        debug!("copy: inode {src} -> inode {dst}, {} blocks shared", source.nblocks());
        Ok(dst)
    }

    /// Appends file `name2` of `dir2` to file `name1` of `dir1`. Returns the new size of file 1.
    pub fn append(
        &self,
        dir1: InodeId,
        name1: &str,
        dir2: InodeId,
        name2: &str,
    ) -> Result<u32> {
        check_name(name1)?;
        check_name(name2)?;
        let mut meta = self.meta.write();

        meta.dir(dir1)?;
        let f1 = self
            .dir_lookup(&meta, dir1, name1)?
            .ok_or_else(|| FsError::NotFound(name1.to_owned()))?;
        let first = meta.file(f1)?.clone();
        meta.dir(dir2)?;
        let f2 = self
            .dir_lookup(&meta, dir2, name2)?
            .ok_or_else(|| FsError::NotFound(name2.to_owned()))?;
        let second = meta.file(f2)?.clone();

        if first.nblocks() + second.nblocks() > NDIRECT {
            warn!("append: {name2} does not fit after {name1}");
            return Err(FsError::NoSpace("direct block slots"));
        }
        if second.size == 0 {
            return Ok(first.size);
        }

        if first.size as usize % BSIZE == 0 {
            let base = first.nblocks();
            for (i, &bno) in second.blocks().iter().enumerate() {
                meta.refs[bno as usize] += 1;
                meta.inode_mut(f1).addrs[base + i] = bno;
            }
            meta.inode_mut(f1).size += second.size;
            self.store_meta(&meta)?;
            Ok(first.size + second.size)
        } else {
            // block sharing would leave a gap after the partial last block
            let bytes = self.read_at(&meta, f2, 0, second.size as usize)?;
            self.write_at(&mut meta, f1, first.size as usize, &bytes)
        }
    }

    pub(crate) fn read_at(
        &self,
        meta: &FsMeta,
        ino: InodeId,
        offset: usize,
        count: usize,
    ) -> Result<Vec<u8>> {
        let inode = meta.used(ino)?;
        let size = inode.size as usize;
        if offset >= size {
            return Ok(Vec::new());
        }

        let end = size.min(offset.saturating_add(count));
        let mut out = Vec::with_capacity(end - offset);
        let mut pos = offset;
        while pos < end {
            let slot = pos / BSIZE;
            let block = self.read_data(inode.kind, inode.addrs[slot] as usize)?;
            let start = pos % BSIZE;
            let num = (BSIZE - start).min(end - pos);
            out.extend_from_slice(&block[start..start + num]);
            pos += num;
        }
        Ok(out)
    }

    pub(crate) fn write_at(
        &self,
        meta: &mut FsMeta,
        ino: InodeId,
        offset: usize,
        data: &[u8],
    ) -> Result<u32> {
        let inode = meta.file(ino)?;
        let size = inode.size as usize;
        if data.is_empty() {
            return Ok(inode.size);
        }

        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= MAXFILE)
            .ok_or(FsError::NoSpace("direct block slots"))?;

        let used = inode.nblocks();
        let first = offset / BSIZE;
        let last = (end - 1) / BSIZE;
        let fresh = (last + 1).saturating_sub(used);
        let shared = (first..=last)
            .filter(|&slot| slot < used && meta.refs[inode.addrs[slot] as usize] > 1)
            .count();
        if meta.free_block_count() < fresh + shared {
            warn!("write: inode {ino} needs {} blocks", fresh + shared);
            return Err(FsError::NoSpace("blocks"));
        }

        // slots between the old end and `first` are a hole and get zeros
        for slot in first.min(used)..=last {
            let base = slot * BSIZE;
            let lo = offset.max(base);
            let hi = end.min(base + BSIZE);

            if slot < used {
                let bno = meta.inodes[ino as usize].addrs[slot] as usize;
                let mut block = self.read_data(FileKind::File, bno)?;
                block[lo - base..hi - base].copy_from_slice(&data[lo - offset..hi - offset]);
                self.write_slot(meta, ino, slot, &block)?;
            } else {
                let mut block = [0u8; BSIZE];
                if lo < hi {
                    block[lo - base..hi - base].copy_from_slice(&data[lo - offset..hi - offset]);
                }
                let bno = meta.free_block()?;
                self.write_data(FileKind::File, bno, &block)?;
                meta.claim(bno);
                meta.inode_mut(ino).addrs[slot] = bno as u32;
            }
        }

        let inode = meta.inode_mut(ino);
        inode.size = size.max(end) as u32;
        let size = inode.size;
        self.store_meta(meta)?;
        debug!("write: inode {ino} {} bytes at {offset}, size {size}", data.len());
        Ok(size)
    }

    /// File blocks go through the cache, directory blocks straight to the disk.
    pub(crate) fn read_data(&self, kind: FileKind, bno: usize) -> Result<Block> {
        match kind {
            FileKind::File => self.cache.read(bno),
            _ => {
                let mut block = [0u8; BSIZE];
                self.store.read_block(bno, &mut block)?;
                Ok(block)
            }
        }
    }

    pub(crate) fn write_data(&self, kind: FileKind, bno: usize, block: &Block) -> Result<()> {
        match kind {
            FileKind::File => self.cache.write(bno, block),
            _ => self.store.write_block(bno, block),
        }
    }

    /// Gives inode `ino` a private copy of the block in `slot` if it shares it.
    /// Returns the block number the slot names afterwards.
    pub(crate) fn cow(&self, meta: &mut FsMeta, ino: InodeId, slot: usize) -> Result<usize> {
        let inode = &meta.inodes[ino as usize];
        let kind = inode.kind;
        let bno = inode.addrs[slot] as usize;
        if meta.refs[bno] <= 1 {
            return Ok(bno);
        }

        let content = self.read_data(kind, bno)?;
        let copy = meta.free_block()?;
        self.write_data(kind, copy, &content)?;
        meta.claim(copy);
        meta.inode_mut(ino).addrs[slot] = copy as u32;
        meta.refs[bno] -= 1;
        debug!("cow: inode {ino} slot {slot}: {bno} -> {copy}");
        Ok(copy)
    }

    /// Copy-on-write, then overwrite the block in `slot`.
    pub(crate) fn write_slot(
        &self,
        meta: &mut FsMeta,
        ino: InodeId,
        slot: usize,
        block: &Block,
    ) -> Result<()> {
        let kind = meta.inodes[ino as usize].kind;
        let bno = self.cow(meta, ino, slot)?;
        self.write_data(kind, bno, block)
    }

    /// Drops one reference; the last one zeroes and frees the block.
    pub(crate) fn release_block(&self, meta: &mut FsMeta, kind: FileKind, bno: usize) -> Result<()> {
        match meta.refs[bno] {
            0 => panic!("releasing unreferenced block {bno}"),
            1 => {
                match kind {
                    FileKind::File => self.cache.discard(bno)?,
                    _ => self.store.write_block(bno, &[0u8; BSIZE])?,
                }
                meta.refs[bno] = 0;
                meta.blk_bmap.clear(bno);
            }
            _ => meta.refs[bno] -= 1,
        }
        Ok(())
    }

    /// bitmaps and inode table(mem) -> blocks 0-9(disk)
    pub(crate) fn store_meta(&self, meta: &FsMeta) -> Result<()> {
        self.store
            .write_block(BBITMAP_BLOCK, meta.blk_bmap.as_block())?;
        self.store
            .write_block(IBITMAP_BLOCK, meta.inode_bmap.as_block())?;
        for (i, block) in encode_itab(&meta.inodes)?.iter().enumerate() {
            self.store.write_block(ITAB_START + i, block)?;
        }
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if let Some(mut ager) = self.ager.take() {
            ager.stop();
        }
        if let Err(e) = self.cache.flush_all() {
            warn!("flushing cache on teardown: {e}");
        }
    }
}

fn check_num_blocks(num_blocks: usize) -> std::result::Result<(), String> {
    if num_blocks <= DATA_START || num_blocks > BPB {
        return Err(format!(
            "{num_blocks} blocks, need more than {DATA_START} and at most {BPB}"
        ));
    }
    Ok(())
}

/// blocks 0-9(disk) -> bitmaps and inode table(mem)
fn load_meta(store: &BlockStore) -> Result<FsMeta> {
    let num_blocks = store.num_blocks();
    let mut block = [0u8; BSIZE];

    store.read_block(BBITMAP_BLOCK, &mut block)?;
    let blk_bmap = BitMap::from_block(&block, num_blocks);
    store.read_block(IBITMAP_BLOCK, &mut block)?;
    let inode_bmap = BitMap::from_block(&block, NINODES);

    let mut itab = vec![[0u8; BSIZE]; ITAB_BLOCKS];
    for (i, block) in itab.iter_mut().enumerate() {
        store.read_block(ITAB_START + i, block)?;
    }
    let inodes =
        decode_itab(&itab).map_err(|e| FsError::BadImage(format!("inode table: {e}")))?;

    Ok(FsMeta {
        blk_bmap,
        inode_bmap,
        inodes,
        refs: vec![0; num_blocks],
    })
}
