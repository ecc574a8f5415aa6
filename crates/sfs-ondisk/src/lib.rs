#![forbid(unsafe_code)]
//! Bit-exact on-disk structures of the SimpleFS format.
//!
//! The partition is divided into five block-aligned regions:
//!
//! 1. the superblock (block 0),
//! 2. the inode store,
//! 3. the inode-free bitmap,
//! 4. the block-free bitmap,
//! 5. the data region.
//!
//! This crate defines the byte layouts of the superblock, the 104-byte inode
//! record, the extent-index block and the directory block, together with the
//! run-length gap encoding used for free directory slots. All integers are
//! little-endian `u32`. Parsers return `ParseError` and never panic,
//! whatever the input bytes.

use sfs_types::{
    ensure_slice, nul_terminated, read_fixed, read_le_u32, write_le_u32, BlockNo, InodeNo,
    ParseError, BITS_PER_BLOCK, BLOCK_SIZE, EXTENT_RECORD_SIZE, FILENAME_LEN, FILES_PER_BLOCK,
    FILE_RECORD_SIZE, INODES_PER_BLOCK, INODE_RECORD_SIZE, MAX_EXTENTS, SFS_MAGIC,
    SYMLINK_TARGET_MAX,
};
use std::fmt;

// ── Superblock ───────────────────────────────────────────────────────────────

/// The superblock at block 0: region sizes and free-resource counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
}

impl Superblock {
    /// Derive a superblock for a fresh image of `nr_blocks` x `nr_inodes`.
    ///
    /// Free counters account for the metadata regions plus the root
    /// directory (one inode, one extent-index block).
    pub fn for_geometry(nr_blocks: u32, nr_inodes: u32) -> Result<Self, ParseError> {
        if nr_inodes == 0 {
            return Err(ParseError::InvalidField {
                field: "nr_inodes",
                reason: "cannot be zero",
            });
        }
        let nr_istore_blocks = nr_inodes.div_ceil(INODES_PER_BLOCK as u32);
        let nr_ifree_blocks = nr_inodes.div_ceil(BITS_PER_BLOCK as u32);
        let nr_bfree_blocks = nr_blocks.div_ceil(BITS_PER_BLOCK as u32);
        let meta = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks;

        // The data region must hold at least the root index block.
        if nr_blocks <= meta {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "device too small for metadata regions",
            });
        }

        Ok(Self {
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            nr_free_inodes: nr_inodes - 1,
            nr_free_blocks: nr_blocks - meta - 1,
        })
    }

    /// Parse the superblock from block 0. Checks the magic number only;
    /// geometry consistency is `validate()`.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(block, 0x00)?;
        if magic != SFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SFS_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            nr_blocks: read_le_u32(block, 0x04)?,
            nr_inodes: read_le_u32(block, 0x08)?,
            nr_istore_blocks: read_le_u32(block, 0x0C)?,
            nr_ifree_blocks: read_le_u32(block, 0x10)?,
            nr_bfree_blocks: read_le_u32(block, 0x14)?,
            nr_free_inodes: read_le_u32(block, 0x18)?,
            nr_free_blocks: read_le_u32(block, 0x1C)?,
        })
    }

    /// Serialize into a full block; trailing bytes are zero.
    #[must_use]
    pub fn to_block_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        write_le_u32(&mut buf, 0x00, SFS_MAGIC);
        write_le_u32(&mut buf, 0x04, self.nr_blocks);
        write_le_u32(&mut buf, 0x08, self.nr_inodes);
        write_le_u32(&mut buf, 0x0C, self.nr_istore_blocks);
        write_le_u32(&mut buf, 0x10, self.nr_ifree_blocks);
        write_le_u32(&mut buf, 0x14, self.nr_bfree_blocks);
        write_le_u32(&mut buf, 0x18, self.nr_free_inodes);
        write_le_u32(&mut buf, 0x1C, self.nr_free_blocks);
        buf
    }

    /// Check that the recorded region sizes are consistent: each derived
    /// count matches, the regions fit, and free counters stay in range.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.nr_inodes == 0 {
            return Err(ParseError::InvalidField {
                field: "nr_inodes",
                reason: "cannot be zero",
            });
        }
        if self.nr_istore_blocks != self.nr_inodes.div_ceil(INODES_PER_BLOCK as u32) {
            return Err(ParseError::InvalidField {
                field: "nr_istore_blocks",
                reason: "does not match nr_inodes",
            });
        }
        if self.nr_ifree_blocks != self.nr_inodes.div_ceil(BITS_PER_BLOCK as u32) {
            return Err(ParseError::InvalidField {
                field: "nr_ifree_blocks",
                reason: "does not match nr_inodes",
            });
        }
        if self.nr_bfree_blocks != self.nr_blocks.div_ceil(BITS_PER_BLOCK as u32) {
            return Err(ParseError::InvalidField {
                field: "nr_bfree_blocks",
                reason: "does not match nr_blocks",
            });
        }
        let meta = 1_u64
            + u64::from(self.nr_istore_blocks)
            + u64::from(self.nr_ifree_blocks)
            + u64::from(self.nr_bfree_blocks);
        if meta >= u64::from(self.nr_blocks) {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "metadata regions leave no data region",
            });
        }
        if self.nr_free_inodes >= self.nr_inodes {
            return Err(ParseError::InvalidField {
                field: "nr_free_inodes",
                reason: "exceeds nr_inodes minus root",
            });
        }
        if u64::from(self.nr_free_blocks) > u64::from(self.nr_blocks) - meta {
            return Err(ParseError::InvalidField {
                field: "nr_free_blocks",
                reason: "exceeds data region size",
            });
        }
        Ok(())
    }
}

/// Start blocks of the four regions after the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub inode_store_start: u32,
    pub inode_bitmap_start: u32,
    pub block_bitmap_start: u32,
    pub data_start: u32,
}

impl Layout {
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        let inode_store_start = 1;
        let inode_bitmap_start = inode_store_start + sb.nr_istore_blocks;
        let block_bitmap_start = inode_bitmap_start + sb.nr_ifree_blocks;
        let data_start = block_bitmap_start + sb.nr_bfree_blocks;
        Self {
            inode_store_start,
            inode_bitmap_start,
            block_bitmap_start,
            data_start,
        }
    }

    /// Block and byte offset of an inode record in the inode store.
    #[must_use]
    pub fn inode_location(&self, ino: InodeNo) -> (BlockNo, usize) {
        let block = self.inode_store_start + ino.0 / INODES_PER_BLOCK as u32;
        let offset = (ino.0 as usize % INODES_PER_BLOCK) * INODE_RECORD_SIZE;
        (BlockNo(block), offset)
    }
}

// ── Inode record ─────────────────────────────────────────────────────────────

/// POSIX mode bits used to classify inodes.
pub mod file_mode {
    pub const S_IFMT: u32 = 0o170_000;
    pub const S_IFREG: u32 = 0o100_000;
    pub const S_IFDIR: u32 = 0o040_000;
    pub const S_IFLNK: u32 = 0o120_000;
}

/// Classification of an inode by its mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & file_mode::S_IFMT {
            file_mode::S_IFREG => Some(Self::Regular),
            file_mode::S_IFDIR => Some(Self::Directory),
            file_mode::S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// One 104-byte record in the inode store.
///
/// `data` holds the inline symlink target (NUL-terminated) when the mode
/// says symlink and is unused otherwise. The record tail past the defined
/// fields is reserved and serializes as zeroes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    pub blocks: u32,
    pub nlink: u32,
    pub ei_block: u32,
    pub data: [u8; SYMLINK_TARGET_MAX],
}

impl Inode {
    /// Parse one record from `bytes` (at least `INODE_RECORD_SIZE` long).
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_RECORD_SIZE)?;
        Ok(Self {
            mode: read_le_u32(bytes, 0x00)?,
            uid: read_le_u32(bytes, 0x04)?,
            gid: read_le_u32(bytes, 0x08)?,
            size: read_le_u32(bytes, 0x0C)?,
            ctime: read_le_u32(bytes, 0x10)?,
            atime: read_le_u32(bytes, 0x14)?,
            mtime: read_le_u32(bytes, 0x18)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            nlink: read_le_u32(bytes, 0x20)?,
            ei_block: read_le_u32(bytes, 0x24)?,
            data: read_fixed::<SYMLINK_TARGET_MAX>(bytes, 0x28)?,
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut buf = [0_u8; INODE_RECORD_SIZE];
        write_le_u32(&mut buf, 0x00, self.mode);
        write_le_u32(&mut buf, 0x04, self.uid);
        write_le_u32(&mut buf, 0x08, self.gid);
        write_le_u32(&mut buf, 0x0C, self.size);
        write_le_u32(&mut buf, 0x10, self.ctime);
        write_le_u32(&mut buf, 0x14, self.atime);
        write_le_u32(&mut buf, 0x18, self.mtime);
        write_le_u32(&mut buf, 0x1C, self.blocks);
        write_le_u32(&mut buf, 0x20, self.nlink);
        write_le_u32(&mut buf, 0x24, self.ei_block);
        buf[0x28..0x28 + SYMLINK_TARGET_MAX].copy_from_slice(&self.data);
        buf
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    /// A zeroed record, as left behind by the final unlink.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.mode == 0 && self.nlink == 0
    }

    /// Inline symlink target bytes, when this inode is a symlink.
    #[must_use]
    pub fn symlink_target(&self) -> Option<&[u8]> {
        match self.kind() {
            Some(FileKind::Symlink) => Some(nul_terminated(&self.data)),
            _ => None,
        }
    }

    /// Store `target` inline, NUL-terminated. The target must fit in
    /// `SYMLINK_TARGET_MAX - 1` bytes.
    pub fn set_symlink_target(&mut self, target: &[u8]) -> Result<(), ParseError> {
        if target.len() + 1 > SYMLINK_TARGET_MAX {
            return Err(ParseError::InvalidField {
                field: "symlink target",
                reason: "longer than the inline capacity",
            });
        }
        self.data = [0_u8; SYMLINK_TARGET_MAX];
        self.data[..target.len()].copy_from_slice(target);
        Ok(())
    }
}

// ── Extent index ─────────────────────────────────────────────────────────────

/// One 16-byte extent record: a run of contiguous physical blocks.
///
/// `nr_files` counts live directory entries residing in this extent and is
/// zero for file extents. An extent with `start == 0` is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    /// First logical block within the owning file or directory.
    pub logical_start: u32,
    /// Number of blocks covered, `1..=MAX_BLOCKS_PER_EXTENT`.
    pub len: u32,
    /// First physical block, 0 when the record is empty.
    pub start: u32,
    /// Live directory entries within this extent.
    pub nr_files: u32,
}

impl Extent {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == 0
    }

    fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            logical_start: read_le_u32(block, offset)?,
            len: read_le_u32(block, offset + 0x04)?,
            start: read_le_u32(block, offset + 0x08)?,
            nr_files: read_le_u32(block, offset + 0x0C)?,
        })
    }

    fn write_at(&self, block: &mut [u8], offset: usize) {
        write_le_u32(block, offset, self.logical_start);
        write_le_u32(block, offset + 0x04, self.len);
        write_le_u32(block, offset + 0x08, self.start);
        write_le_u32(block, offset + 0x0C, self.nr_files);
    }
}

/// The per-object extent-index block: a live-entry count (directories only)
/// followed by `MAX_EXTENTS` extent records. Non-empty records form a
/// contiguous prefix ordered by logical start.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtentIndex {
    pub nr_files: u32,
    pub extents: [Extent; MAX_EXTENTS],
}

impl ExtentIndex {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            nr_files: 0,
            extents: [Extent::default(); MAX_EXTENTS],
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let nr_files = read_le_u32(block, 0x00)?;
        let mut extents = [Extent::default(); MAX_EXTENTS];
        for (i, slot) in extents.iter_mut().enumerate() {
            *slot = Extent::parse_at(block, 4 + i * EXTENT_RECORD_SIZE)?;
        }
        Ok(Self { nr_files, extents })
    }

    /// Serialize into a full block; the trailing bytes are zero.
    #[must_use]
    pub fn to_block_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        write_le_u32(&mut buf, 0x00, self.nr_files);
        for (i, extent) in self.extents.iter().enumerate() {
            extent.write_at(&mut buf, 4 + i * EXTENT_RECORD_SIZE);
        }
        buf
    }

    /// The non-empty extents, in index order. Stops at the first empty
    /// record: empty records form a contiguous suffix.
    pub fn live_extents(&self) -> impl Iterator<Item = (usize, &Extent)> {
        self.extents
            .iter()
            .enumerate()
            .take_while(|(_, e)| !e.is_empty())
    }
}

impl Default for ExtentIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ExtentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentIndex")
            .field("nr_files", &self.nr_files)
            .field("live_extents", &self.live_extents().count())
            .finish()
    }
}

// ── Directory block ──────────────────────────────────────────────────────────

/// One 263-byte directory record.
///
/// `run_len` does double duty: on a free slot (`inode == 0`) it is the
/// length of the gap starting there; on a live entry it is 1 for a
/// singleton, or the entry plus the free tail behind it. Callers never
/// manipulate it directly; `DirBlock` owns the encoding.
#[derive(Clone, Copy)]
pub struct FileRecord {
    pub inode: u32,
    run_len: u32,
    name: [u8; FILENAME_LEN],
}

impl FileRecord {
    fn free(run_len: u32) -> Self {
        Self {
            inode: 0,
            run_len,
            name: [0_u8; FILENAME_LEN],
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inode == 0
    }

    /// The filename bytes up to the first NUL.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        nul_terminated(&self.name)
    }

    #[must_use]
    pub fn name_matches(&self, name: &[u8]) -> bool {
        self.name_bytes() == name
    }

    fn set_name(&mut self, name: &[u8]) {
        self.name = [0_u8; FILENAME_LEN];
        let len = name.len().min(FILENAME_LEN);
        self.name[..len].copy_from_slice(&name[..len]);
    }

    fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            inode: read_le_u32(block, offset)?,
            run_len: read_le_u32(block, offset + 0x04)?,
            name: read_fixed::<FILENAME_LEN>(block, offset + 0x08)?,
        })
    }

    fn write_at(&self, block: &mut [u8], offset: usize) {
        write_le_u32(block, offset, self.inode);
        write_le_u32(block, offset + 0x04, self.run_len);
        block[offset + 0x08..offset + 0x08 + FILENAME_LEN].copy_from_slice(&self.name);
    }
}

impl fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecord")
            .field("inode", &self.inode)
            .field("run_len", &self.run_len)
            .field("name", &String::from_utf8_lossy(self.name_bytes()))
            .finish()
    }
}

/// One physical block of a directory: a live-entry count and
/// `FILES_PER_BLOCK` packed records under the gap encoding.
#[derive(Debug, Clone)]
pub struct DirBlock {
    nr_files: u32,
    files: [FileRecord; FILES_PER_BLOCK],
}

impl DirBlock {
    /// A freshly-provisioned block: one gap covering every slot. Slots
    /// covered by the gap stay zeroed; only run heads carry meaning.
    #[must_use]
    pub fn fresh() -> Self {
        let mut files = [FileRecord::free(0); FILES_PER_BLOCK];
        files[0] = FileRecord::free(FILES_PER_BLOCK as u32);
        Self { nr_files: 0, files }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let nr_files = read_le_u32(block, 0x00)?;
        let mut files = [FileRecord::free(0); FILES_PER_BLOCK];
        for (i, slot) in files.iter_mut().enumerate() {
            *slot = FileRecord::parse_at(block, 4 + i * FILE_RECORD_SIZE)?;
        }
        Ok(Self { nr_files, files })
    }

    /// Serialize into a full block; the trailing bytes are zero.
    #[must_use]
    pub fn to_block_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_SIZE];
        write_le_u32(&mut buf, 0x00, self.nr_files);
        for (i, record) in self.files.iter().enumerate() {
            record.write_at(&mut buf, 4 + i * FILE_RECORD_SIZE);
        }
        buf
    }

    #[must_use]
    pub fn nr_files(&self) -> u32 {
        self.nr_files
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.nr_files as usize >= FILES_PER_BLOCK
    }

    /// Visit every run head: each live entry and each gap head, in slot
    /// order. Advances by the run length, clamped so corrupt input cannot
    /// loop forever.
    pub fn walk(&self) -> impl Iterator<Item = (usize, &FileRecord)> {
        let mut fi = 0_usize;
        std::iter::from_fn(move || {
            if fi >= FILES_PER_BLOCK {
                return None;
            }
            let slot = fi;
            let record = &self.files[slot];
            fi += record.run_len.max(1) as usize;
            Some((slot, record))
        })
    }

    /// The live entries of this block, bounded by the recorded live count.
    pub fn live_entries(&self) -> impl Iterator<Item = (usize, &FileRecord)> {
        self.walk()
            .filter(|(_, record)| !record.is_free())
            .take(self.nr_files as usize)
    }

    /// Place a new entry under the gap encoding. Returns `false` when the
    /// block is full or the encoding has no usable run head (corruption).
    ///
    /// A fresh or gap-led block takes the entry at slot 0, inheriting the
    /// gap's run length (the entry now heads the run). Otherwise the entry
    /// goes right after the last leading singleton, stealing one slot from
    /// that run head.
    pub fn insert(&mut self, ino: InodeNo, name: &[u8]) -> bool {
        if self.is_full() {
            return false;
        }

        if self.nr_files != 0 && !self.files[0].is_free() {
            let Some(fi) = (0..FILES_PER_BLOCK - 1).find(|&i| self.files[i].run_len != 1) else {
                return false;
            };
            let tail = self.files[fi].run_len - 1;
            self.files[fi + 1].inode = ino.0;
            self.files[fi + 1].run_len = tail;
            self.files[fi + 1].set_name(name);
            self.files[fi].run_len = 1;
        } else {
            self.files[0].inode = ino.0;
            self.files[0].set_name(name);
        }

        self.nr_files += 1;
        true
    }

    /// Free the entry at `slot`, merging its run into the nearest preceding
    /// live entry (or the slot-0 gap head) so that the walk still covers
    /// every slot.
    pub fn remove_at(&mut self, slot: usize) {
        if slot >= FILES_PER_BLOCK || self.files[slot].is_free() {
            return;
        }
        self.files[slot].inode = 0;
        for i in (0..slot).rev() {
            if !self.files[i].is_free() || i == 0 {
                self.files[i].run_len += self.files[slot].run_len;
                break;
            }
        }
        self.nr_files = self.nr_files.saturating_sub(1);
    }

    /// Overwrite the filename of the live entry at `slot` (in-place rename).
    pub fn set_name_at(&mut self, slot: usize, name: &[u8]) {
        if slot < FILES_PER_BLOCK && !self.files[slot].is_free() {
            self.files[slot].set_name(name);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sfs_types::MAX_BLOCKS_PER_EXTENT;

    fn walk_coverage(block: &DirBlock) -> usize {
        block
            .walk()
            .map(|(_, record)| record.run_len.max(1) as usize)
            .sum()
    }

    // ── Superblock ──────────────────────────────────────────────────────

    #[test]
    fn superblock_roundtrip() {
        let sb = Superblock::for_geometry(4096, 1024).unwrap();
        let bytes = sb.to_block_bytes();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        let back = Superblock::parse(&bytes).unwrap();
        assert_eq!(back, sb);
        back.validate().unwrap();
    }

    #[test]
    fn superblock_geometry() {
        // 1024 inodes: 1024/39 = 26.3 -> 27 store blocks, one bitmap block
        // each; data starts at 30; root takes the first data block.
        let sb = Superblock::for_geometry(4096, 1024).unwrap();
        assert_eq!(sb.nr_istore_blocks, 27);
        assert_eq!(sb.nr_ifree_blocks, 1);
        assert_eq!(sb.nr_bfree_blocks, 1);
        assert_eq!(sb.nr_free_inodes, 1023);
        assert_eq!(sb.nr_free_blocks, 4096 - 30 - 1);

        let layout = Layout::from_superblock(&sb);
        assert_eq!(layout.inode_store_start, 1);
        assert_eq!(layout.inode_bitmap_start, 28);
        assert_eq!(layout.block_bitmap_start, 29);
        assert_eq!(layout.data_start, 30);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut bytes = Superblock::for_geometry(256, 64).unwrap().to_block_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_tiny_device() {
        assert!(Superblock::for_geometry(4, 64).is_err());
        assert!(Superblock::for_geometry(0, 64).is_err());
    }

    #[test]
    fn superblock_validate_catches_mismatched_regions() {
        let mut sb = Superblock::for_geometry(4096, 1024).unwrap();
        sb.nr_istore_blocks += 1;
        assert!(sb.validate().is_err());

        let mut sb = Superblock::for_geometry(4096, 1024).unwrap();
        sb.nr_free_blocks = sb.nr_blocks;
        assert!(sb.validate().is_err());
    }

    #[test]
    fn inode_location_addressing() {
        let sb = Superblock::for_geometry(4096, 1024).unwrap();
        let layout = Layout::from_superblock(&sb);

        let (block, offset) = layout.inode_location(InodeNo(0));
        assert_eq!((block, offset), (BlockNo(1), 0));

        let (block, offset) = layout.inode_location(InodeNo(38));
        assert_eq!((block, offset), (BlockNo(1), 38 * INODE_RECORD_SIZE));

        let (block, offset) = layout.inode_location(InodeNo(39));
        assert_eq!((block, offset), (BlockNo(2), 0));

        let (block, offset) = layout.inode_location(InodeNo(40));
        assert_eq!((block, offset), (BlockNo(2), INODE_RECORD_SIZE));
    }

    // ── Inode record ────────────────────────────────────────────────────

    #[test]
    fn inode_roundtrip() {
        let mut inode = Inode {
            mode: file_mode::S_IFREG | 0o644,
            uid: 1000,
            gid: 100,
            size: 12_345,
            ctime: 1_700_000_000,
            atime: 1_700_000_001,
            mtime: 1_700_000_002,
            blocks: 4,
            nlink: 2,
            ei_block: 77,
            data: [0_u8; SYMLINK_TARGET_MAX],
        };
        inode.data[0] = 0xEE;

        let raw = inode.serialize();
        assert_eq!(raw.len(), INODE_RECORD_SIZE);
        // Reserved tail serializes as zeroes.
        assert!(raw[0x28 + SYMLINK_TARGET_MAX..].iter().all(|&b| b == 0));

        let back = Inode::parse(&raw).unwrap();
        assert_eq!(back, inode);
        assert_eq!(back.kind(), Some(FileKind::Regular));
    }

    #[test]
    fn inode_classification() {
        let mut inode = Inode::default();
        assert_eq!(inode.kind(), None);
        assert!(inode.is_unused());

        inode.mode = file_mode::S_IFDIR | 0o755;
        assert_eq!(inode.kind(), Some(FileKind::Directory));
        inode.mode = file_mode::S_IFLNK | 0o777;
        assert_eq!(inode.kind(), Some(FileKind::Symlink));
        inode.mode = 0o644;
        assert_eq!(inode.kind(), None);
    }

    #[test]
    fn symlink_target_inline() {
        let mut inode = Inode {
            mode: file_mode::S_IFLNK | 0o777,
            ..Inode::default()
        };
        inode.set_symlink_target(b"target").unwrap();
        assert_eq!(inode.symlink_target(), Some(&b"target"[..]));
        assert_eq!(&inode.data[..8], b"target\0\0");

        // 31 bytes still fit (NUL included makes 32); 32 do not.
        assert!(inode.set_symlink_target(&[b'x'; 31]).is_ok());
        assert!(inode.set_symlink_target(&[b'x'; 32]).is_err());
    }

    #[test]
    fn inode_parse_rejects_short_input() {
        assert!(Inode::parse(&[0_u8; INODE_RECORD_SIZE - 1]).is_err());
    }

    // ── Extent index ────────────────────────────────────────────────────

    #[test]
    fn extent_index_roundtrip() {
        let mut index = ExtentIndex::empty();
        index.nr_files = 17;
        index.extents[0] = Extent {
            logical_start: 0,
            len: MAX_BLOCKS_PER_EXTENT,
            start: 30,
            nr_files: 15,
        };
        index.extents[1] = Extent {
            logical_start: 8,
            len: MAX_BLOCKS_PER_EXTENT,
            start: 50,
            nr_files: 2,
        };

        let bytes = index.to_block_bytes();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        // Trailing bytes past the record array stay zero.
        assert!(bytes[4 + MAX_EXTENTS * EXTENT_RECORD_SIZE..]
            .iter()
            .all(|&b| b == 0));

        let back = ExtentIndex::parse(&bytes).unwrap();
        assert_eq!(back, index);
        assert_eq!(back.live_extents().count(), 2);
    }

    #[test]
    fn live_extents_stop_at_first_empty() {
        let mut index = ExtentIndex::empty();
        index.extents[0].start = 10;
        index.extents[0].len = 8;
        // Slot 1 left empty; a record in slot 2 would violate the
        // contiguous-suffix invariant and must not be visited.
        index.extents[2].start = 99;
        assert_eq!(index.live_extents().count(), 1);
    }

    // ── Directory block ─────────────────────────────────────────────────

    #[test]
    fn fresh_block_is_one_gap() {
        let block = DirBlock::fresh();
        assert_eq!(block.nr_files(), 0);
        let heads: Vec<_> = block.walk().collect();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].0, 0);
        assert!(heads[0].1.is_free());
        assert_eq!(walk_coverage(&block), FILES_PER_BLOCK);
    }

    #[test]
    fn dir_block_roundtrip() {
        let mut block = DirBlock::fresh();
        assert!(block.insert(InodeNo(5), b"hello.txt"));
        assert!(block.insert(InodeNo(9), b"world"));

        let bytes = block.to_block_bytes();
        let back = DirBlock::parse(&bytes).unwrap();
        assert_eq!(back.nr_files(), 2);
        let names: Vec<_> = back
            .live_entries()
            .map(|(_, r)| (r.inode, r.name_bytes().to_vec()))
            .collect();
        assert_eq!(names, vec![(5, b"hello.txt".to_vec()), (9, b"world".to_vec())]);
    }

    #[test]
    fn insert_fills_slots_in_order() {
        let mut block = DirBlock::fresh();
        for i in 0..FILES_PER_BLOCK {
            assert!(block.insert(InodeNo(i as u32 + 1), format!("f{i}").as_bytes()));
            assert_eq!(walk_coverage(&block), FILES_PER_BLOCK);
            assert_eq!(block.live_entries().count(), i + 1);
        }
        assert!(block.is_full());
        assert!(!block.insert(InodeNo(99), b"overflow"));

        let slots: Vec<_> = block.live_entries().map(|(slot, _)| slot).collect();
        assert_eq!(slots, (0..FILES_PER_BLOCK).collect::<Vec<_>>());
    }

    #[test]
    fn remove_merges_gap_into_predecessor() {
        let mut block = DirBlock::fresh();
        for i in 0..5 {
            block.insert(InodeNo(i + 1), format!("f{i}").as_bytes());
        }

        // Remove the middle entry: the walk must still cover every slot and
        // skip the freed one.
        let slot = block
            .live_entries()
            .find(|(_, r)| r.name_matches(b"f2"))
            .map(|(slot, _)| slot)
            .unwrap();
        block.remove_at(slot);

        assert_eq!(block.nr_files(), 4);
        assert_eq!(walk_coverage(&block), FILES_PER_BLOCK);
        let names: Vec<_> = block
            .live_entries()
            .map(|(_, r)| r.name_bytes().to_vec())
            .collect();
        assert_eq!(names, vec![b"f0".to_vec(), b"f1".to_vec(), b"f3".to_vec(), b"f4".to_vec()]);
    }

    #[test]
    fn remove_first_entry_leaves_gap_head() {
        let mut block = DirBlock::fresh();
        block.insert(InodeNo(1), b"a");
        block.insert(InodeNo(2), b"b");

        block.remove_at(0);
        assert_eq!(block.nr_files(), 1);
        assert_eq!(walk_coverage(&block), FILES_PER_BLOCK);

        // The survivor behind the leading gap is still found.
        let names: Vec<_> = block
            .live_entries()
            .map(|(_, r)| r.name_bytes().to_vec())
            .collect();
        assert_eq!(names, vec![b"b".to_vec()]);
    }

    #[test]
    fn reinsert_after_remove_reuses_slots() {
        let mut block = DirBlock::fresh();
        for i in 0..FILES_PER_BLOCK {
            block.insert(InodeNo(i as u32 + 1), format!("f{i}").as_bytes());
        }
        // Free two entries, then fill the block again.
        let victims: Vec<_> = block
            .live_entries()
            .filter(|(_, r)| r.name_matches(b"f3") || r.name_matches(b"f7"))
            .map(|(slot, _)| slot)
            .collect();
        for slot in victims {
            block.remove_at(slot);
        }
        assert_eq!(block.nr_files() as usize, FILES_PER_BLOCK - 2);

        assert!(block.insert(InodeNo(50), b"g0"));
        assert!(block.insert(InodeNo(51), b"g1"));
        assert!(block.is_full());
        assert_eq!(walk_coverage(&block), FILES_PER_BLOCK);
        assert_eq!(block.live_entries().count(), FILES_PER_BLOCK);
    }

    #[test]
    fn set_name_at_renames_in_place() {
        let mut block = DirBlock::fresh();
        block.insert(InodeNo(1), b"before");
        let slot = block.live_entries().next().unwrap().0;
        block.set_name_at(slot, b"after");
        let (_, record) = block.live_entries().next().unwrap();
        assert!(record.name_matches(b"after"));
        assert_eq!(record.inode, 1);
    }

    #[test]
    fn drain_block_restores_fresh_shape() {
        let mut block = DirBlock::fresh();
        for i in 0..FILES_PER_BLOCK {
            block.insert(InodeNo(i as u32 + 1), format!("f{i}").as_bytes());
        }
        // Remove back to front.
        for i in (0..FILES_PER_BLOCK).rev() {
            let slot = block
                .live_entries()
                .find(|(_, r)| r.name_matches(format!("f{i}").as_bytes()))
                .map(|(slot, _)| slot)
                .unwrap();
            block.remove_at(slot);
        }
        assert_eq!(block.nr_files(), 0);
        assert_eq!(walk_coverage(&block), FILES_PER_BLOCK);
        // One run head covering the whole block again.
        assert_eq!(block.walk().count(), 1);
    }

    // ── Adversarial parsing ─────────────────────────────────────────────

    proptest! {
        #[test]
        fn parsers_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..=BLOCK_SIZE)) {
            let _ = Superblock::parse(&bytes);
            let _ = Inode::parse(&bytes);
            let _ = ExtentIndex::parse(&bytes);
            if let Ok(block) = DirBlock::parse(&bytes) {
                // The walk is bounded even when run lengths are garbage.
                prop_assert!(block.walk().count() <= FILES_PER_BLOCK);
                let _ = block.live_entries().count();
            }
        }

        #[test]
        fn superblock_any_geometry_roundtrips(nr_blocks in 64_u32..1_000_000, nr_inodes in 1_u32..100_000) {
            if let Ok(sb) = Superblock::for_geometry(nr_blocks, nr_inodes) {
                let back = Superblock::parse(&sb.to_block_bytes()).unwrap();
                prop_assert_eq!(back, sb);
                prop_assert!(back.validate().is_ok());
            }
        }
    }
}
