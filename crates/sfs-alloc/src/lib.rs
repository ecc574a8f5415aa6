#![forbid(unsafe_code)]
//! Inode and data-block allocation.
//!
//! Two bitmaps back the allocator: one bit per inode, one bit per block,
//! each loaded whole at mount time. First-fit, lowest index wins; no
//! best-fit. Every mutation writes the touched backing block(s) straight
//! back through the device, so a bitmap block is dirty in the device layer
//! the moment a bit changes and the host's `sync` decides durability.
//!
//! ## Layers
//!
//! 1. **Raw helpers**: bit manipulation on byte-slice bitmaps.
//! 2. **`Bitmap`**: an in-memory region tied to its backing blocks.
//! 3. **Entry points**: `alloc_inode`/`alloc_blocks`/`free_inode`/
//!    `free_blocks`, which keep the superblock counters in step.

use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::Superblock;
use sfs_types::{BlockNo, InodeNo, BITS_PER_BLOCK, BLOCK_SIZE};

// ── Raw bitmap helpers ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find the first run of `n` contiguous free bits in the first `count` bits.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0_u32;
    let mut run_len = 0_u32;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

// ── Bitmap region ────────────────────────────────────────────────────────────

/// An in-memory bitmap covering `nbits` resources, backed by whole blocks
/// starting at `start_block`.
#[derive(Debug, Clone)]
pub struct Bitmap {
    start_block: u32,
    nbits: u32,
    bytes: Vec<u8>,
}

impl Bitmap {
    /// Load a bitmap region of `nr_blocks` backing blocks from the device.
    pub fn load(
        dev: &dyn BlockDevice,
        start_block: BlockNo,
        nr_blocks: u32,
        nbits: u32,
    ) -> Result<Self> {
        if u64::from(nbits) > u64::from(nr_blocks) * BITS_PER_BLOCK as u64 {
            return Err(SfsError::Corruption {
                block: start_block.0,
                detail: format!("bitmap region too small for {nbits} bits"),
            });
        }
        let mut bytes = Vec::with_capacity(nr_blocks as usize * BLOCK_SIZE);
        for i in 0..nr_blocks {
            let buf = dev.read_block(BlockNo(start_block.0 + i))?;
            bytes.extend_from_slice(buf.as_slice());
        }
        Ok(Self {
            start_block: start_block.0,
            nbits,
            bytes,
        })
    }

    /// Write every backing block back to the device.
    pub fn flush(&self, dev: &dyn BlockDevice) -> Result<()> {
        for (i, chunk) in self.bytes.chunks(BLOCK_SIZE).enumerate() {
            dev.write_block(BlockNo(self.start_block + i as u32), chunk)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    #[must_use]
    pub fn get(&self, bit: u32) -> bool {
        bitmap_get(&self.bytes, bit)
    }

    #[must_use]
    pub fn count_free(&self) -> u32 {
        bitmap_count_free(&self.bytes, self.nbits)
    }

    /// Write back the backing blocks covering the bit range `lo..=hi`.
    fn write_backing(&self, dev: &dyn BlockDevice, lo: u32, hi: u32) -> Result<()> {
        let first = lo as usize / BITS_PER_BLOCK;
        let last = hi as usize / BITS_PER_BLOCK;
        for i in first..=last {
            let chunk = &self.bytes[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
            dev.write_block(BlockNo(self.start_block + i as u32), chunk)?;
        }
        Ok(())
    }
}

// ── Allocation entry points ──────────────────────────────────────────────────

/// Allocate one inode: first zero bit in the inode bitmap.
///
/// Bit 0 is the root directory and is set at format time, so a successful
/// allocation never returns inode 0.
pub fn alloc_inode(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    ifree: &mut Bitmap,
) -> Result<InodeNo> {
    if sb.nr_free_inodes == 0 {
        return Err(SfsError::NoSpace);
    }
    let Some(bit) = bitmap_find_free(&ifree.bytes, ifree.nbits) else {
        return Err(SfsError::NoSpace);
    };
    bitmap_set(&mut ifree.bytes, bit);
    ifree.write_backing(dev, bit, bit)?;
    sb.nr_free_inodes -= 1;
    Ok(InodeNo(bit))
}

/// Release one inode back to the bitmap.
pub fn free_inode(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    ifree: &mut Bitmap,
    ino: InodeNo,
) -> Result<()> {
    if ino.0 >= ifree.nbits || !bitmap_get(&ifree.bytes, ino.0) {
        return Err(SfsError::Corruption {
            block: ifree.start_block,
            detail: format!("freeing unallocated inode {ino}"),
        });
    }
    bitmap_clear(&mut ifree.bytes, ino.0);
    ifree.write_backing(dev, ino.0, ino.0)?;
    sb.nr_free_inodes += 1;
    Ok(())
}

/// Allocate `n` contiguous blocks: first zero-bit run of length `n` in the
/// block bitmap.
pub fn alloc_blocks(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    bfree: &mut Bitmap,
    n: u32,
) -> Result<BlockNo> {
    if n == 0 {
        return Err(SfsError::Inval("cannot allocate 0 blocks"));
    }
    if sb.nr_free_blocks < n {
        return Err(SfsError::NoSpace);
    }
    let Some(first) = bitmap_find_contiguous(&bfree.bytes, bfree.nbits, n) else {
        return Err(SfsError::NoSpace);
    };
    for bit in first..first + n {
        bitmap_set(&mut bfree.bytes, bit);
    }
    bfree.write_backing(dev, first, first + n - 1)?;
    sb.nr_free_blocks -= n;
    Ok(BlockNo(first))
}

/// Release `n` contiguous blocks starting at `start`.
pub fn free_blocks(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    bfree: &mut Bitmap,
    start: BlockNo,
    n: u32,
) -> Result<()> {
    let Some(end) = start.0.checked_add(n) else {
        return Err(SfsError::Inval("block range overflows"));
    };
    if n == 0 || end > bfree.nbits {
        return Err(SfsError::Inval("block range out of bitmap"));
    }
    for bit in start.0..end {
        if !bitmap_get(&bfree.bytes, bit) {
            return Err(SfsError::Corruption {
                block: bfree.start_block,
                detail: format!("freeing unallocated block {bit}"),
            });
        }
        bitmap_clear(&mut bfree.bytes, bit);
    }
    bfree.write_backing(dev, start.0, end - 1)?;
    sb.nr_free_blocks += n;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
