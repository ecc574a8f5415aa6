#![forbid(unsafe_code)]
//! Extent-index helpers.
//!
//! A file or directory owns one extent-index block naming up to
//! `MAX_EXTENTS` runs of contiguous physical blocks. This crate resolves
//! logical blocks to extents, picks the extent a new directory entry should
//! land in, provisions fresh directory extents, and releases extents on the
//! unlink path.

use sfs_alloc::{alloc_blocks, free_blocks, Bitmap};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{DirBlock, Extent, ExtentIndex, Superblock};
use sfs_types::{BlockNo, FILES_PER_EXTENT, MAX_BLOCKS_PER_EXTENT, MAX_EXTENTS};
use tracing::warn;

// ── Search ───────────────────────────────────────────────────────────────────

/// Find the extent covering `logical`, if any. Logical ranges are
/// non-overlapping and ordered, so the first hit is the only one.
#[must_use]
pub fn search(index: &ExtentIndex, logical: u32) -> Option<usize> {
    index.live_extents().find_map(|(i, extent)| {
        let covers = extent.logical_start <= logical
            && logical < extent.logical_start.saturating_add(extent.len);
        covers.then_some(i)
    })
}

// ── Available slot ───────────────────────────────────────────────────────────

/// Choose the extent slot a new directory entry should go into.
///
/// Walking in index order: a non-empty extent with room wins outright; the
/// first empty slot seen is remembered as a fallback; once the directory's
/// live entries are all accounted for, the slot after the last counted
/// extent becomes the fallback. `None` means no slot fits (the caller's
/// `MAX_SUBFILES` guard makes that unreachable in practice).
#[must_use]
pub fn available_slot(index: &ExtentIndex) -> Option<usize> {
    let mut remaining = index.nr_files;
    let mut first_empty: Option<usize> = None;

    for (i, extent) in index.extents.iter().enumerate() {
        if !extent.is_empty() && extent.nr_files != FILES_PER_EXTENT as u32 {
            return Some(i);
        }
        if extent.is_empty() {
            if first_empty.is_none() {
                first_empty = Some(i);
            }
        } else {
            remaining = remaining.saturating_sub(extent.nr_files);
            if first_empty.is_none() && remaining == 0 {
                first_empty = (i + 1 < MAX_EXTENTS).then_some(i + 1);
            }
        }
        if remaining == 0 {
            break;
        }
    }

    first_empty
}

// ── Provisioning ─────────────────────────────────────────────────────────────

/// Provision `index.extents[slot]` as a fresh directory extent.
///
/// Allocates `MAX_BLOCKS_PER_EXTENT` contiguous blocks, chains the logical
/// start after the preceding extent, and seeds every block as an empty
/// directory block (one gap spanning all slots). If seeding fails the run
/// is released and the record stays empty.
pub fn provision_dir_extent(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    bfree: &mut Bitmap,
    index: &mut ExtentIndex,
    slot: usize,
) -> Result<()> {
    if slot >= MAX_EXTENTS {
        return Err(SfsError::Inval("extent slot out of range"));
    }

    let first = alloc_blocks(dev, sb, bfree, MAX_BLOCKS_PER_EXTENT)?;
    let logical_start = if slot == 0 {
        0
    } else {
        let prev = &index.extents[slot - 1];
        prev.logical_start + prev.len
    };
    let record = Extent {
        logical_start,
        len: MAX_BLOCKS_PER_EXTENT,
        start: first.0,
        nr_files: 0,
    };

    let fresh = DirBlock::fresh().to_block_bytes();
    for bi in 0..record.len {
        if let Err(err) = dev.write_block(BlockNo(record.start + bi), &fresh) {
            if let Err(nested) = free_blocks(dev, sb, bfree, first, MAX_BLOCKS_PER_EXTENT) {
                warn!(
                    target: "sfs::extent",
                    block = first.0,
                    error = %nested,
                    "failed to release extent after seeding error"
                );
            }
            return Err(err);
        }
    }

    index.extents[slot] = record;
    Ok(())
}

// ── Release ──────────────────────────────────────────────────────────────────

/// Scrub and release one extent's blocks on the unlink path.
///
/// Blocks are zeroed before the bitmap release so a lost write suffix
/// leaves interpretable structures. A failed zeroing is logged and the
/// block released anyway; not releasing would leak it for good.
pub fn release_and_scrub(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    bfree: &mut Bitmap,
    extent: &Extent,
) -> Result<()> {
    if extent.is_empty() {
        return Ok(());
    }
    for bi in 0..extent.len {
        let block = BlockNo(extent.start + bi);
        if let Err(err) = dev.zero_block(block) {
            warn!(
                target: "sfs::extent",
                block = block.0,
                error = %err,
                "ignoring scrub failure, releasing block anyway"
            );
        }
    }
    free_blocks(dev, sb, bfree, BlockNo(extent.start), extent.len)
}

// ── Tests ────────────────────────────────────────────────────────────────────
