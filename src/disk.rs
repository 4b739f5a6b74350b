//! The virtual disk: `num_blocks` fixed-size blocks kept in memory.
//!
//! Image file layout:
//! [ block_size: u32 | num_blocks: u32 | num_blocks * block_size raw bytes ]
//! both header words little endian.

use super::*;
use block_device::BlockDevice;

use log::{debug, info};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use std::thread;
use std::time::Duration;

/// two u32 header words
const HEADER_LEN: u64 = 8;

/// largest block size an image may declare
const MAX_BLOCK_SIZE: usize = 64 * 1024;

pub struct BlockStore {
    block_size: usize,
    num_blocks: usize,
    /// slept on every block read and write
    io_delay: Duration,
    blocks: RwLock<Vec<u8>>,
}

impl BlockStore {
    /// A zero-filled disk.
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self> {
        if num_blocks == 0 || block_size == 0 {
            return Err(FsError::InvalidArgument(format!(
                "disk of {num_blocks} blocks of {block_size} bytes"
            )));
        }
        Ok(Self {
            block_size,
            num_blocks,
            io_delay: Duration::ZERO,
            blocks: RwLock::new(vec![0u8; num_blocks * block_size]),
        })
    }

    pub fn set_io_delay(&mut self, io_delay: Duration) {
        self.io_delay = io_delay;
    }

    pub fn io_delay(&self) -> Duration {
        self.io_delay
    }

    fn delay(&self) {
        if !self.io_delay.is_zero() {
            thread::sleep(self.io_delay);
        }
    }

    fn check(&self, blockno: usize, len: usize) -> Result<()> {
        if blockno >= self.num_blocks {
            return Err(FsError::OutOfRange {
                block: blockno,
                num_blocks: self.num_blocks,
            });
        }
        if len != self.block_size {
            return Err(FsError::InvalidArgument(format!(
                "buffer of {len} bytes for a {} byte block",
                self.block_size
            )));
        }
        Ok(())
    }

    /// image(file) -> disk(mem).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let block_size = read_u32(&mut reader)? as usize;
        let num_blocks = read_u32(&mut reader)? as usize;
        if block_size == 0 || block_size > MAX_BLOCK_SIZE || num_blocks == 0 {
            return Err(FsError::BadImage(format!(
                "{}: {num_blocks} blocks of {block_size} bytes",
                path.display()
            )));
        }
        // the header must describe exactly the bytes that follow it
        let body = num_blocks
            .checked_mul(block_size)
            .filter(|&body| body as u64 == file_len.saturating_sub(HEADER_LEN))
            .ok_or_else(|| {
                FsError::BadImage(format!(
                    "{}: {num_blocks} blocks of {block_size} bytes in a {file_len} byte image",
                    path.display()
                ))
            })?;

        let mut raw = vec![0u8; body];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                FsError::BadImage(format!("{}: truncated image", path.display()))
            }
            _ => FsError::Io(e),
        })?;

        info!(
            "loaded {} ({} blocks of {} bytes)",
            path.display(),
            num_blocks,
            block_size
        );
        Ok(Self {
            block_size,
            num_blocks,
            io_delay: Duration::ZERO,
            blocks: RwLock::new(raw),
        })
    }

    /// disk(mem) -> image(file).
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&(self.block_size as u32).to_le_bytes())?;
        writer.write_all(&(self.num_blocks as u32).to_le_bytes())?;
        {
            let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
            writer.write_all(&blocks)?;
        }
        writer.flush()?;
        info!("stored {} blocks to {}", self.num_blocks, path.display());
        Ok(())
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FsError::BadImage("truncated header".to_owned()),
        _ => FsError::Io(e),
    })?;
    Ok(u32::from_le_bytes(word))
}

impl BlockDevice for BlockStore {
    fn read_block(&self, blockno: usize, buf: &mut [u8]) -> Result<()> {
        self.check(blockno, buf.len())?;
        self.delay();
        let start = blockno * self.block_size;
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&blocks[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&self, blockno: usize, buf: &[u8]) -> Result<()> {
        self.check(blockno, buf.len())?;
        self.delay();
        let start = blockno * self.block_size;
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        blocks[start..start + self.block_size].copy_from_slice(buf);
        debug!("disk: wrote block {blockno}");
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}
