#![forbid(unsafe_code)]
//! Directory lookup and mutation.
//!
//! A directory's contents live in directory blocks beneath its extent
//! index; free slots are encoded as gap runs inside the entry table. Every
//! mutation here touches one directory block plus the caller's in-memory
//! extent index, and writes the directory block before the caller persists
//! the index, so a lost write suffix leaves interpretable structures.
//!
//! Lookup walks every block bounded by the recorded live counts; a leading
//! gap in a block does not end the search.

use sfs_alloc::{free_blocks, Bitmap};
use sfs_block::BlockDevice;
use sfs_error::{Result, SfsError};
use sfs_extent::{available_slot, provision_dir_extent};
use sfs_ondisk::{DirBlock, Extent, ExtentIndex, Superblock};
use sfs_types::{BlockNo, InodeNo, MAX_EXTENTS, MAX_SUBFILES};
use tracing::warn;

// ── Lookup ───────────────────────────────────────────────────────────────────

/// Find the live entry named `name`, returning its inode number.
pub fn find_entry(
    dev: &dyn BlockDevice,
    index: &ExtentIndex,
    name: &[u8],
) -> Result<Option<InodeNo>> {
    for (_, extent) in index.live_extents() {
        for bi in 0..extent.len {
            let buf = dev.read_block(BlockNo(extent.start + bi))?;
            let block = DirBlock::parse(buf.as_slice())?;
            let hit = block
                .live_entries()
                .find_map(|(_, record)| record.name_matches(name).then(|| InodeNo(record.inode)));
            if let Some(ino) = hit {
                return Ok(Some(ino));
            }
        }
    }
    Ok(None)
}

// ── Insert ───────────────────────────────────────────────────────────────────

/// Write `name -> ino` into the first directory block with room inside
/// `extent`.
fn insert_into_extent(
    dev: &dyn BlockDevice,
    extent: &Extent,
    name: &[u8],
    ino: InodeNo,
) -> Result<()> {
    for bi in 0..extent.len {
        let block_no = BlockNo(extent.start + bi);
        let buf = dev.read_block(block_no)?;
        let mut block = DirBlock::parse(buf.as_slice())?;
        if block.is_full() {
            continue;
        }
        if !block.insert(ino, name) {
            return Err(SfsError::Corruption {
                block: block_no.0,
                detail: "directory block has no usable run head".into(),
            });
        }
        dev.write_block(block_no, &block.to_block_bytes())?;
        return Ok(());
    }
    Err(SfsError::Corruption {
        block: extent.start,
        detail: "extent advertised free space but every block is full".into(),
    })
}

/// Insert a directory entry, provisioning a fresh extent when the chosen
/// slot is empty.
///
/// On failure after provisioning, the fresh extent's blocks are released
/// and its record zeroed; the directory is left as it was.
pub fn insert_entry(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    bfree: &mut Bitmap,
    index: &mut ExtentIndex,
    name: &[u8],
    ino: InodeNo,
) -> Result<()> {
    if index.nr_files >= MAX_SUBFILES {
        return Err(SfsError::LinkLimit);
    }
    let slot = available_slot(index).ok_or(SfsError::LinkLimit)?;

    let provisioned = index.extents[slot].is_empty();
    if provisioned {
        provision_dir_extent(dev, sb, bfree, index, slot)?;
    }
    let extent = index.extents[slot];

    match insert_into_extent(dev, &extent, name, ino) {
        Ok(()) => {
            index.extents[slot].nr_files += 1;
            index.nr_files += 1;
            Ok(())
        }
        Err(err) => {
            if provisioned {
                if let Err(nested) =
                    free_blocks(dev, sb, bfree, BlockNo(extent.start), extent.len)
                {
                    warn!(
                        target: "sfs::dir",
                        block = extent.start,
                        error = %nested,
                        "failed to release extent while undoing insert"
                    );
                }
                index.extents[slot] = Extent::default();
            }
            Err(err)
        }
    }
}

// ── Remove ───────────────────────────────────────────────────────────────────

/// Remove the entry matching both `name` and `expect`, merging its slot
/// back into the surrounding gap run.
pub fn remove_entry(
    dev: &dyn BlockDevice,
    index: &mut ExtentIndex,
    name: &[u8],
    expect: InodeNo,
) -> Result<()> {
    let mut remaining = index.nr_files;
    for ei in 0..MAX_EXTENTS {
        if remaining == 0 {
            break;
        }
        let extent = index.extents[ei];
        if extent.is_empty() {
            continue;
        }
        remaining = remaining.saturating_sub(extent.nr_files);

        for bi in 0..extent.len {
            let block_no = BlockNo(extent.start + bi);
            let buf = dev.read_block(block_no)?;
            let mut block = DirBlock::parse(buf.as_slice())?;
            let found = block.live_entries().find_map(|(slot, record)| {
                (record.inode == expect.0 && record.name_matches(name)).then_some(slot)
            });
            let Some(slot) = found else { continue };

            block.remove_at(slot);
            dev.write_block(block_no, &block.to_block_bytes())?;
            index.extents[ei].nr_files -= 1;
            index.nr_files -= 1;
            return Ok(());
        }
    }
    Err(SfsError::NotFound(
        String::from_utf8_lossy(name).into_owned(),
    ))
}

// ── Rename in place ──────────────────────────────────────────────────────────

/// Overwrite the filename of the entry named `old_name`. Returns whether an
/// entry was renamed.
pub fn rename_entry(
    dev: &dyn BlockDevice,
    index: &ExtentIndex,
    old_name: &[u8],
    new_name: &[u8],
) -> Result<bool> {
    for (_, extent) in index.live_extents() {
        for bi in 0..extent.len {
            let block_no = BlockNo(extent.start + bi);
            let buf = dev.read_block(block_no)?;
            let mut block = DirBlock::parse(buf.as_slice())?;
            let found = block
                .live_entries()
                .find_map(|(slot, record)| record.name_matches(old_name).then_some(slot));
            let Some(slot) = found else { continue };

            block.set_name_at(slot, new_name);
            dev.write_block(block_no, &block.to_block_bytes())?;
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fail_device::FailOnSecondWrite;
    use sfs_block::MemBlockDevice;
    use sfs_types::{BLOCK_SIZE, FILES_PER_BLOCK, FILES_PER_EXTENT};

    fn fixture() -> (MemBlockDevice, Superblock, Bitmap) {
        let dev = MemBlockDevice::new(4096);
        let sb = Superblock::for_geometry(4096, 1024).unwrap();

        let mut bbytes = vec![0_u8; BLOCK_SIZE];
        for bit in 0..=30 {
            sfs_alloc::bitmap_set(&mut bbytes, bit);
        }
        dev.write_block(BlockNo(29), &bbytes).unwrap();
        let bfree = Bitmap::load(&dev, BlockNo(29), sb.nr_bfree_blocks, sb.nr_blocks).unwrap();
        (dev, sb, bfree)
    }

    /// Device that lets the first write to a block through (extent
    /// seeding) and fails the second (the entry insert).
    mod fail_device {
        use super::*;
        use sfs_block::BlockBuf;
        use std::sync::atomic::{AtomicU32, Ordering};

        pub struct FailOnSecondWrite {
            pub inner: MemBlockDevice,
            pub fail_block: u32,
            pub writes_seen: AtomicU32,
        }

        impl BlockDevice for FailOnSecondWrite {
            fn read_block(&self, block: BlockNo) -> Result<BlockBuf> {
                self.inner.read_block(block)
            }

            fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
                if block.0 == self.fail_block
                    && self.writes_seen.fetch_add(1, Ordering::SeqCst) >= 1
                {
                    return Err(SfsError::Io(std::io::Error::from(
                        std::io::ErrorKind::Other,
                    )));
                }
                self.inner.write_block(block, data)
            }

            fn block_count(&self) -> u32 {
                self.inner.block_count()
            }

            fn sync(&self) -> Result<()> {
                self.inner.sync()
            }
        }
    }

    #[test]
    fn insert_then_find() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();

        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"hello.txt", InodeNo(7)).unwrap();

        assert_eq!(index.nr_files, 1);
        assert_eq!(index.extents[0].nr_files, 1);
        assert_eq!(
            find_entry(&dev, &index, b"hello.txt").unwrap(),
            Some(InodeNo(7))
        );
        assert_eq!(find_entry(&dev, &index, b"missing").unwrap(), None);
    }

    #[test]
    fn insert_rejects_full_directory() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();
        index.nr_files = MAX_SUBFILES;

        assert!(matches!(
            insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"x", InodeNo(1)),
            Err(SfsError::LinkLimit)
        ));
    }

    #[test]
    fn entries_spill_into_second_block_of_extent() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();

        for i in 0..FILES_PER_BLOCK + 1 {
            let name = format!("f{i}");
            insert_entry(
                &dev,
                &mut sb,
                &mut bfree,
                &mut index,
                name.as_bytes(),
                InodeNo(i as u32 + 1),
            )
            .unwrap();
        }

        // Still one extent: block 0 full, the overflow entry in block 1.
        assert_eq!(index.extents[0].nr_files as usize, FILES_PER_BLOCK + 1);
        assert!(index.extents[1].is_empty());

        let buf = dev.read_block(BlockNo(index.extents[0].start + 1)).unwrap();
        let block = DirBlock::parse(buf.as_slice()).unwrap();
        assert_eq!(block.nr_files(), 1);

        let name = format!("f{FILES_PER_BLOCK}");
        assert!(find_entry(&dev, &index, name.as_bytes()).unwrap().is_some());
    }

    #[test]
    fn extent_rollover_after_filling_first_extent() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();

        for i in 0..FILES_PER_EXTENT {
            let name = format!("f{i}");
            insert_entry(
                &dev,
                &mut sb,
                &mut bfree,
                &mut index,
                name.as_bytes(),
                InodeNo(i as u32 + 1),
            )
            .unwrap();
        }
        assert_eq!(index.extents[0].nr_files as usize, FILES_PER_EXTENT);
        assert!(index.extents[1].is_empty());

        // One more entry provisions extent 1 and lands in its first block.
        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"straw", InodeNo(999)).unwrap();
        assert!(!index.extents[1].is_empty());
        assert_eq!(index.extents[1].nr_files, 1);
        assert_eq!(
            index.extents[1].logical_start,
            index.extents[0].logical_start + index.extents[0].len
        );

        let buf = dev.read_block(BlockNo(index.extents[1].start)).unwrap();
        let block = DirBlock::parse(buf.as_slice()).unwrap();
        assert_eq!(block.nr_files(), 1);
        assert_eq!(find_entry(&dev, &index, b"straw").unwrap(), Some(InodeNo(999)));
    }

    #[test]
    fn remove_then_find_misses() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();

        for (i, name) in [b"a".as_slice(), b"b", b"c"].into_iter().enumerate() {
            insert_entry(&dev, &mut sb, &mut bfree, &mut index, name, InodeNo(i as u32 + 1))
                .unwrap();
        }

        remove_entry(&dev, &mut index, b"b", InodeNo(2)).unwrap();
        assert_eq!(index.nr_files, 2);
        assert_eq!(index.extents[0].nr_files, 2);
        assert_eq!(find_entry(&dev, &index, b"b").unwrap(), None);
        assert_eq!(find_entry(&dev, &index, b"a").unwrap(), Some(InodeNo(1)));
        assert_eq!(find_entry(&dev, &index, b"c").unwrap(), Some(InodeNo(3)));
    }

    #[test]
    fn remove_missing_entry_is_not_found() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();
        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"a", InodeNo(1)).unwrap();

        assert!(matches!(
            remove_entry(&dev, &mut index, b"zzz", InodeNo(9)),
            Err(SfsError::NotFound(_))
        ));
        // A name match with the wrong inode number does not count.
        assert!(matches!(
            remove_entry(&dev, &mut index, b"a", InodeNo(2)),
            Err(SfsError::NotFound(_))
        ));
        assert_eq!(index.nr_files, 1);
    }

    #[test]
    fn find_survives_leading_gap() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();

        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"first", InodeNo(1)).unwrap();
        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"second", InodeNo(2)).unwrap();
        remove_entry(&dev, &mut index, b"first", InodeNo(1)).unwrap();

        // The surviving entry sits behind a gap at slot 0.
        assert_eq!(find_entry(&dev, &index, b"second").unwrap(), Some(InodeNo(2)));
    }

    #[test]
    fn slot_reuse_after_remove() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();

        for (i, name) in [b"a".as_slice(), b"b", b"c"].into_iter().enumerate() {
            insert_entry(&dev, &mut sb, &mut bfree, &mut index, name, InodeNo(i as u32 + 1))
                .unwrap();
        }
        remove_entry(&dev, &mut index, b"b", InodeNo(2)).unwrap();
        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"d", InodeNo(4)).unwrap();

        assert_eq!(index.nr_files, 3);
        // No extra extent was needed for the reinsert.
        assert!(index.extents[1].is_empty());
        assert_eq!(find_entry(&dev, &index, b"d").unwrap(), Some(InodeNo(4)));
    }

    #[test]
    fn rename_in_place() {
        let (dev, mut sb, mut bfree) = fixture();
        let mut index = ExtentIndex::empty();
        insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"old", InodeNo(3)).unwrap();

        assert!(rename_entry(&dev, &index, b"old", b"new").unwrap());
        assert_eq!(find_entry(&dev, &index, b"old").unwrap(), None);
        assert_eq!(find_entry(&dev, &index, b"new").unwrap(), Some(InodeNo(3)));
        assert_eq!(index.nr_files, 1);

        assert!(!rename_entry(&dev, &index, b"ghost", b"whatever").unwrap());
    }

    #[test]
    fn failed_insert_releases_fresh_extent() {
        let (dev, mut sb, mut bfree) = fixture();
        let free_before = sb.nr_free_blocks;

        // The first extent will be seeded at blocks 31..=38; the entry then
        // goes to block 31. Fail that second write.
        let dev = FailOnSecondWrite {
            inner: dev,
            fail_block: 31,
            writes_seen: std::sync::atomic::AtomicU32::new(0),
        };
        let mut index = ExtentIndex::empty();

        let err = insert_entry(&dev, &mut sb, &mut bfree, &mut index, b"x", InodeNo(1));
        assert!(matches!(err, Err(SfsError::Io(_))));

        assert_eq!(index.nr_files, 0);
        assert!(index.extents[0].is_empty());
        assert_eq!(sb.nr_free_blocks, free_before);
        for bit in 31..39 {
            assert!(!bfree.get(bit));
        }
    }
}
