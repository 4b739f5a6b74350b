use super::*;
use fs::{FileSystem, FsMeta};

use std::fmt::Write;

/// Paths referencing one data block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockUsage {
    pub block: usize,
    pub paths: Vec<String>,
}

impl FileSystem {
    /// Every block reachable from the root with the paths that use it, by block number.
    /// Shared blocks list every path sharing them.
    pub fn disk_usage(&self) -> Result<Vec<BlockUsage>> {
        let meta = self.meta.read();
        let mut refs = Vec::new();
        if meta.used(ROOTINO).is_ok() {
            self.collect_refs(&meta, ROOTINO, "", &mut refs)?;
        }
        // stable: paths of a block keep tree order
        refs.sort_by_key(|(block, _)| *block);

        let mut usage: Vec<BlockUsage> = Vec::new();
        for (block, path) in refs {
            match usage.last_mut() {
                Some(last) if last.block == block => last.paths.push(path),
                _ => usage.push(BlockUsage {
                    block,
                    paths: vec![path],
                }),
            }
        }
        Ok(usage)
    }

    fn collect_refs(
        &self,
        meta: &FsMeta,
        ino: InodeId,
        path: &str,
        refs: &mut Vec<(usize, String)>,
    ) -> Result<()> {
        let inode = meta.used(ino)?;
        let shown = if path.is_empty() { "/" } else { path };
        for &bno in inode.blocks() {
            refs.push((bno as usize, shown.to_owned()));
        }
        if inode.is_dir() {
            for de in self.dir_entries(meta, ino)? {
                let child = format!("{path}/{}", de.name());
                self.collect_refs(meta, de.inum(), &child, refs)?;
            }
        }
        Ok(())
    }

    pub fn dump_disk_usage(&self) -> Result<String> {
        let mut out = String::from("===== Dump: FileSystem Blocks =======================\n");
        for usage in self.disk_usage()? {
            let _ = writeln!(out, "blk_id: {}", usage.block);
            for (i, path) in usage.paths.iter().enumerate() {
                let _ = writeln!(out, "file_name{}: {path}", i + 1);
            }
        }
        out.push_str("*******************************************************\n");
        Ok(out)
    }

    /// Holds the writer side so no operation changes the cache mid-dump.
    pub fn dump_cache(&self) -> String {
        let _meta = self.meta.write();
        self.cache.dump()
    }

    pub fn dump_bitmaps(&self) -> String {
        let meta = self.meta.read();
        format!(
            "Free block bitmap:\n{}\nFree inode table bitmap:\n{}\n",
            meta.blk_bmap.dump(),
            meta.inode_bmap.dump()
        )
    }

    /// In-use inodes with kind, size and direct blocks.
    pub fn dump_inodes(&self) -> String {
        let meta = self.meta.read();
        let mut out = String::new();
        for ino in ROOTINO as usize..NINODES {
            if !meta.inode_bmap.is_set(ino) {
                continue;
            }
            let inode = &meta.inodes[ino];
            let _ = writeln!(out, "inode {ino}: {:?} {} bytes", inode.kind, inode.size);
            for (slot, bno) in inode.addrs.iter().enumerate().filter(|&(_, &bno)| bno > 0) {
                let _ = writeln!(out, "  addrs[{slot}] = {bno}");
            }
        }
        out
    }
}
