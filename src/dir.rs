//! Directories: a packed array of 16-byte entries spread over the direct blocks.
//! Removal moves the last entry into the hole, so the array never has gaps.

use super::*;
use fs::{FileSystem, FsMeta};
use inode::{check_name, read_dirent, write_dirent, DInode, DirEnt, FileKind, FileName};

use log::{debug, info};

impl FileSystem {
    /// Resolves an absolute path. Empty components are skipped, so "/" is the root.
    pub fn lookup(&self, path: &str) -> Result<InodeId> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument(format!(
                "path {path:?} is not absolute"
            )));
        }
        let meta = self.meta.read();
        let not_found = || FsError::NotFound(path.to_owned());

        let mut ino = ROOTINO;
        meta.used(ino).map_err(|_| not_found())?;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            if !meta.used(ino)?.is_dir() {
                return Err(not_found());
            }
            ino = self.dir_lookup(&meta, ino, name)?.ok_or_else(not_found)?;
        }
        Ok(ino)
    }

    /// New empty file `name` in `dir`.
    pub fn create(&self, dir: InodeId, name: &str) -> Result<InodeId> {
        check_name(name)?;
        let mut meta = self.meta.write();
        self.create_in(&mut meta, dir, name, FileKind::File)
    }

    /// New empty directory `name` in `dir`.
    pub fn mkdir(&self, dir: InodeId, name: &str) -> Result<InodeId> {
        check_name(name)?;
        let mut meta = self.meta.write();
        self.create_in(&mut meta, dir, name, FileKind::Directory)
    }

    /// At most `max` entries of `dir`, in storage order.
    pub fn readdir(&self, dir: InodeId, max: usize) -> Result<Vec<FileName>> {
        let meta = self.meta.read();
        let entries = self.dir_entries(&meta, dir)?;
        Ok(entries
            .into_iter()
            .take(max)
            .map(|de| FileName {
                name: de.name(),
                kind: meta.inodes[de.inum() as usize].kind,
            })
            .collect())
    }

    /// Unlinks `name` from `dir` and frees its inode. Directories must be empty.
    /// Returns the freed inode.
    pub fn remove(&self, dir: InodeId, name: &str) -> Result<InodeId> {
        check_name(name)?;
        let mut meta = self.meta.write();
        let (idx, ino) = self
            .dir_find(&meta, dir, name)?
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;

        let target = meta.used(ino)?.clone();
        if target.is_dir() && target.size != 0 {
            return Err(FsError::NonEmptyDirectory(name.to_owned()));
        }
        for &bno in target.blocks() {
            self.release_block(&mut meta, target.kind, bno as usize)?;
        }
        self.dir_remove(&mut meta, dir, idx)?;

        *meta.inode_mut(ino) = DInode::default();
        meta.inode_bmap.clear(ino as usize);
        self.store_meta(&meta)?;
        info!("removed {name} (inode {ino}) from inode {dir}");
        Ok(ino)
    }

    pub(crate) fn create_in(
        &self,
        meta: &mut FsMeta,
        dir: InodeId,
        name: &str,
        kind: FileKind,
    ) -> Result<InodeId> {
        if self.dir_find(meta, dir, name)?.is_some() {
            return Err(FsError::AlreadyExists(name.to_owned()));
        }
        let ino = meta
            .inode_bmap
            .find_free_from(ROOTINO as usize + 1)
            .ok_or(FsError::NoSpace("inodes"))? as InodeId;

        self.dir_add(meta, dir, name, ino)?;
        meta.inode_bmap.set(ino as usize);
        *meta.inode_mut(ino) = DInode::new(kind);
        self.store_meta(meta)?;
        debug!("create: {name} -> inode {ino} ({kind:?}) in inode {dir}");
        Ok(ino)
    }

    pub(crate) fn dir_entries(&self, meta: &FsMeta, dir: InodeId) -> Result<Vec<DirEnt>> {
        let inode = meta.dir(dir)?;
        let n = inode.nentries();
        let mut entries = Vec::with_capacity(n);
        for (slot, &bno) in inode.blocks().iter().enumerate() {
            let block = self.read_data(FileKind::Directory, bno as usize)?;
            let in_block = (n - slot * DPB).min(DPB);
            for idx in 0..in_block {
                let de = read_dirent(&block, idx)?;
                let inum = de.inum() as usize;
                if inum == 0 || inum >= NINODES {
                    return Err(FsError::BadImage(format!(
                        "entry {:?} of inode {dir} names inode {inum}",
                        de.name()
                    )));
                }
                entries.push(de);
            }
        }
        Ok(entries)
    }

    /// Position and inode of entry `name`.
    pub(crate) fn dir_find(
        &self,
        meta: &FsMeta,
        dir: InodeId,
        name: &str,
    ) -> Result<Option<(usize, InodeId)>> {
        Ok(self
            .dir_entries(meta, dir)?
            .iter()
            .enumerate()
            .find(|(_, de)| de.name_is(name))
            .map(|(idx, de)| (idx, de.inum())))
    }

    pub(crate) fn dir_lookup(
        &self,
        meta: &FsMeta,
        dir: InodeId,
        name: &str,
    ) -> Result<Option<InodeId>> {
        Ok(self.dir_find(meta, dir, name)?.map(|(_, ino)| ino))
    }

    /// Appends an entry, taking a new block when the last one is full.
    fn dir_add(&self, meta: &mut FsMeta, dir: InodeId, name: &str, ino: InodeId) -> Result<()> {
        let inode = meta.dir(dir)?;
        let idx = inode.nentries();
        let (slot, off) = (idx / DPB, idx % DPB);
        let dirent = DirEnt::new(name, ino);

        if off == 0 {
            if slot >= NDIRECT {
                return Err(FsError::NoSpace("directory slots"));
            }
            let mut block = [0u8; BSIZE];
            write_dirent(&mut block, 0, &dirent)?;
            let bno = meta.free_block()?;
            self.write_data(FileKind::Directory, bno, &block)?;
            meta.claim(bno);
            meta.inode_mut(dir).addrs[slot] = bno as u32;
        } else {
            let mut block = self.read_data(FileKind::Directory, inode.addrs[slot] as usize)?;
            write_dirent(&mut block, off, &dirent)?;
            self.write_slot(meta, dir, slot, &block)?;
        }
        meta.inode_mut(dir).size += DIRENT_SZ as u32;
        Ok(())
    }

    /// Drops entry `idx`; the last entry takes its place.
    fn dir_remove(&self, meta: &mut FsMeta, dir: InodeId, idx: usize) -> Result<()> {
        let inode = meta.dir(dir)?.clone();
        let last = inode.nentries() - 1;
        let (last_slot, last_off) = (last / DPB, last % DPB);
        let mut last_block =
            self.read_data(FileKind::Directory, inode.addrs[last_slot] as usize)?;

        if idx != last {
            let moved = read_dirent(&last_block, last_off)?;
            let (slot, off) = (idx / DPB, idx % DPB);
            if slot == last_slot {
                write_dirent(&mut last_block, off, &moved)?;
            } else {
                let mut block = self.read_data(FileKind::Directory, inode.addrs[slot] as usize)?;
                write_dirent(&mut block, off, &moved)?;
                self.write_slot(meta, dir, slot, &block)?;
            }
        }

        if last_off == 0 {
            // the last block held only the moved entry
            let bno = meta.inodes[dir as usize].addrs[last_slot] as usize;
            self.release_block(meta, FileKind::Directory, bno)?;
            meta.inode_mut(dir).addrs[last_slot] = 0;
        } else {
            write_dirent(&mut last_block, last_off, &DirEnt::default())?;
            self.write_slot(meta, dir, last_slot, &last_block)?;
        }
        meta.inode_mut(dir).size -= DIRENT_SZ as u32;
        Ok(())
    }
}
