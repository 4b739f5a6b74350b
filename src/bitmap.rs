use super::*;

use std::fmt::Write;

/// Occupancy bits held in a single block.
#[derive(Clone)]
pub struct BitMap {
    bits: [u8; BSIZE],
    /// # of usable bits
    len: usize,
}

fn locate(no: usize) -> (usize, u8) {
    let byte = no / 8; // 第几个 byte
    let bit = no % 8;
    (byte, 1 << bit)
}

impl BitMap {
    pub fn new(len: usize) -> Self {
        assert!(len <= BPB, "bitmap of {len} bits does not fit a block");
        Self {
            bits: [0u8; BSIZE],
            len,
        }
    }

    /// block(disk) -> bitmap(mem)
    pub fn from_block(block: &[u8], len: usize) -> Self {
        let mut bitmap = Self::new(len);
        bitmap.bits.copy_from_slice(&block[..BSIZE]);
        bitmap
    }

    pub fn as_block(&self) -> &[u8; BSIZE] {
        &self.bits
    }

    pub fn is_set(&self, no: usize) -> bool {
        let (byte, mask) = locate(no);
        no < self.len && self.bits[byte] & mask != 0
    }

    pub fn set(&mut self, no: usize) {
        assert!(no < self.len);
        let (byte, mask) = locate(no);
        self.bits[byte] |= mask;
    }

    /// Clears a bit that must be set.
    pub fn clear(&mut self, no: usize) {
        let (byte, mask) = locate(no);
        assert!(self.bits[byte] & mask != 0, "freeing free bit {no}");
        self.bits[byte] &= !mask;
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    /// Lowest clear bit at or above `start`.
    pub fn find_free_from(&self, start: usize) -> Option<usize> {
        (start..self.len).find(|&no| !self.is_set(no))
    }

    /// Highest clear bit at or above `lowest`.
    pub fn find_free_rev(&self, lowest: usize) -> Option<usize> {
        (lowest..self.len).rev().find(|&no| !self.is_set(no))
    }

    pub fn count_free_from(&self, start: usize) -> usize {
        (start..self.len).filter(|&no| !self.is_set(no)).count()
    }

    /// `%x.` per byte, a line break every 32 bytes.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, byte) in self.bits.iter().enumerate() {
            let _ = write!(out, "{byte:x}.");
            if i > 0 && i % 32 == 0 {
                out.push('\n');
            }
        }
        out
    }
}
