use super::*;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    None = 0,
    Directory = 1,
    File = 2,
}

impl Default for FileKind {
    fn default() -> Self {
        FileKind::None
    }
}

/// inode on disk, 64 bytes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DInode {
    /// File type
    pub kind: FileKind,
    /// Size of file (bytes)
    pub size: u32,
    /// Data block addresses, 0 = unused
    pub addrs: [u32; NDIRECT],
    /// reserved for an extension table, never used
    reserved: [u32; NRESERVED],
}

impl DInode {
    pub fn new(kind: FileKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// # of direct blocks in use
    pub fn nblocks(&self) -> usize {
        blocks_for(self.size as usize)
    }

    /// the direct blocks in use
    pub fn blocks(&self) -> &[u32] {
        &self.addrs[..self.nblocks()]
    }

    /// # of dirents, directories only
    pub fn nentries(&self) -> usize {
        self.size as usize / DIRENT_SZ
    }
}

/// inode table(disk) -> inode table(mem)
pub fn decode_itab(blocks: &[Block]) -> Result<Vec<DInode>> {
    let mut inodes = Vec::with_capacity(NINODES);
    for block in blocks {
        for i in 0..IPB {
            let off = i * INODE_SZ;
            inodes.push(bincode::deserialize(&block[off..off + INODE_SZ])?);
        }
    }
    Ok(inodes)
}

/// inode table(mem) -> inode table(disk)
pub fn encode_itab(inodes: &[DInode]) -> Result<Vec<Block>> {
    let mut blocks = vec![[0u8; BSIZE]; blocks_for(inodes.len() * INODE_SZ)];
    for (ino, inode) in inodes.iter().enumerate() {
        let off = (ino % IPB) * INODE_SZ;
        bincode::serialize_into(&mut blocks[ino / IPB][off..off + INODE_SZ], inode)?;
    }
    Ok(blocks)
}

/// directory entry on disk, 16 bytes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirEnt {
    name: [u8; DIRSIZ],
    /// inode num
    inum: InodeId,
}

impl DirEnt {
    /// `name` must have passed `check_name`.
    pub fn new(name: &str, inum: InodeId) -> Self {
        let mut raw = [0u8; DIRSIZ];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Self { name: raw, inum }
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    pub fn name_is(&self, name: &str) -> bool {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len] == name.as_bytes()
    }

    pub fn inum(&self) -> InodeId {
        self.inum
    }
}

pub fn read_dirent(block: &Block, idx: usize) -> Result<DirEnt> {
    let off = idx * DIRENT_SZ;
    Ok(bincode::deserialize(&block[off..off + DIRENT_SZ])?)
}

pub fn write_dirent(block: &mut Block, idx: usize, dirent: &DirEnt) -> Result<()> {
    let off = idx * DIRENT_SZ;
    bincode::serialize_into(&mut block[off..off + DIRENT_SZ], dirent)?;
    Ok(())
}

/// A name fits a dirent: 1..=13 bytes, no '/' and no NUL.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() + 1 > DIRSIZ {
        return Err(FsError::InvalidArgument(format!(
            "name {name:?} must be 1 to {} bytes",
            DIRSIZ - 1
        )));
    }
    if name.contains(['/', '\0']) {
        return Err(FsError::InvalidArgument(format!(
            "name {name:?} contains '/' or NUL"
        )));
    }
    Ok(())
}

/// attributes of a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttrs {
    pub inode: InodeId,
    pub kind: FileKind,
    /// total size in bytes
    pub size: u32,
    /// number of entries if it is a directory
    pub entries: Option<u32>,
}

/// name and type of a directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileName {
    pub name: String,
    pub kind: FileKind,
}
