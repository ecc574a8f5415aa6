#![forbid(unsafe_code)]
//! Mount lifecycle and namespace operations.
//!
//! `SimpleFs` is the mount handle: it owns the block device, the parsed
//! superblock and both free bitmaps, consumes the host-supplied inode
//! cache and clock, and implements lookup, create, mkdir, unlink, rmdir,
//! rename, link and symlink on top of the allocator, extent and directory
//! layers.
//!
//! The host serializes namespace operations per directory; the single
//! mount-state lock here makes the handle shareable, it is not a
//! concurrency design. Within one operation, writes are ordered directory
//! block first, then the extent index, then parent inode metadata, so a
//! lost write suffix stays interpretable.

use parking_lot::Mutex;
use sfs_alloc::{alloc_blocks, alloc_inode, free_blocks, free_inode, Bitmap};
use sfs_block::BlockDevice;
use sfs_dir::{find_entry, insert_entry, remove_entry, rename_entry};
use sfs_error::{Result, SfsError};
use sfs_extent::release_and_scrub;
use sfs_ondisk::{file_mode, FileKind, Inode, ExtentIndex, Layout, Superblock};
use sfs_types::{
    BlockNo, InodeNo, BLOCK_SIZE, FILENAME_LEN, INODE_RECORD_SIZE, MAX_SUBFILES,
    SUPERBLOCK_BLOCK_NO, SYMLINK_TARGET_MAX,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub use sfs_ondisk::file_mode as mode;

/// The root directory's inode number.
pub const ROOT_INO: InodeNo = InodeNo(0);

/// `rename` flag: atomically exchange source and target. Not supported.
pub const RENAME_EXCHANGE: u32 = 0x2;
/// `rename` flag: leave a whiteout at the source. Not supported.
pub const RENAME_WHITEOUT: u32 = 0x4;

// ── Host services ────────────────────────────────────────────────────────────

/// Wall-clock source, supplied by the host.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u32;
}

/// System time in seconds since the epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation)]
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        secs
    }
}

/// Caller identity for create-family operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };
}

/// Outcome of acquiring an inode-cache slot: the host cache either holds
/// the inode already or reports that the slot must be filled from the
/// inode store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    Existing(Inode),
    New,
}

/// Identity-mapped inode cache keyed by inode number, supplied by the
/// host. A kernel host backs this with its own inode cache; the core's
/// materialize routine stays re-entrant through the new/existing flag
/// `acquire` returns.
pub trait InodeCache: Send + Sync {
    /// Acquire the slot for `ino`, reporting whether it is populated.
    fn acquire(&self, ino: InodeNo) -> CacheSlot;

    /// Populate (or refresh) the slot for `ino`.
    fn insert(&self, ino: InodeNo, inode: Inode);

    /// Forget `ino`, after the final unlink.
    fn evict(&self, ino: InodeNo);
}

/// `HashMap`-backed inode cache for hosts without one of their own.
#[derive(Debug, Default)]
pub struct MapInodeCache {
    entries: Mutex<HashMap<u32, Inode>>,
}

impl InodeCache for MapInodeCache {
    fn acquire(&self, ino: InodeNo) -> CacheSlot {
        self.entries
            .lock()
            .get(&ino.0)
            .map_or(CacheSlot::New, |inode| CacheSlot::Existing(*inode))
    }

    fn insert(&self, ino: InodeNo, inode: Inode) {
        self.entries.lock().insert(ino.0, inode);
    }

    fn evict(&self, ino: InodeNo) {
        self.entries.lock().remove(&ino.0);
    }
}

// ── Mount state ──────────────────────────────────────────────────────────────

struct MountState {
    sb: Superblock,
    layout: Layout,
    ifree: Bitmap,
    bfree: Bitmap,
}

/// A mounted SimpleFS image.
pub struct SimpleFs {
    dev: Arc<dyn BlockDevice>,
    clock: Box<dyn Clock>,
    icache: Box<dyn InodeCache>,
    state: Mutex<MountState>,
}

impl SimpleFs {
    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Write a fresh filesystem onto `dev`: superblock, zeroed inode store,
    /// seeded bitmaps and the root directory (inode 0, one empty
    /// extent-index block at the start of the data region).
    pub fn format(dev: &dyn BlockDevice, nr_inodes: u32) -> Result<()> {
        let nr_blocks = dev.block_count();
        let sb = Superblock::for_geometry(nr_blocks, nr_inodes)?;
        let layout = Layout::from_superblock(&sb);
        let root_ei = layout.data_start;

        dev.write_block(BlockNo(SUPERBLOCK_BLOCK_NO), &sb.to_block_bytes())?;

        for i in 0..sb.nr_istore_blocks {
            dev.zero_block(BlockNo(layout.inode_store_start + i))?;
        }
        let root = Inode {
            mode: file_mode::S_IFDIR | 0o755,
            size: BLOCK_SIZE as u32,
            blocks: 1,
            nlink: 2,
            ei_block: root_ei,
            ..Inode::default()
        };
        write_inode_record(dev, &layout, ROOT_INO, &root)?;

        let mut ibytes = vec![0_u8; sb.nr_ifree_blocks as usize * BLOCK_SIZE];
        sfs_alloc::bitmap_set(&mut ibytes, 0);
        for (i, chunk) in ibytes.chunks(BLOCK_SIZE).enumerate() {
            dev.write_block(BlockNo(layout.inode_bitmap_start + i as u32), chunk)?;
        }

        let mut bbytes = vec![0_u8; sb.nr_bfree_blocks as usize * BLOCK_SIZE];
        for bit in 0..=root_ei {
            sfs_alloc::bitmap_set(&mut bbytes, bit);
        }
        for (i, chunk) in bbytes.chunks(BLOCK_SIZE).enumerate() {
            dev.write_block(BlockNo(layout.block_bitmap_start + i as u32), chunk)?;
        }

        dev.zero_block(BlockNo(root_ei))?;
        dev.sync()?;
        debug!(target: "sfs::core", nr_blocks, nr_inodes, "formatted image");
        Ok(())
    }

    /// Mount an image: parse and validate the superblock, load both
    /// bitmaps, and cross-check the free counters against the bit
    /// populations.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::mount_with_clock(dev, Box::new(SystemClock))
    }

    pub fn mount_with_clock(dev: Arc<dyn BlockDevice>, clock: Box<dyn Clock>) -> Result<Self> {
        Self::mount_with(dev, clock, Box::new(MapInodeCache::default()))
    }

    /// Mount with every host service supplied explicitly: block device,
    /// clock and inode cache.
    pub fn mount_with(
        dev: Arc<dyn BlockDevice>,
        clock: Box<dyn Clock>,
        icache: Box<dyn InodeCache>,
    ) -> Result<Self> {
        let buf = dev.read_block(BlockNo(SUPERBLOCK_BLOCK_NO))?;
        let sb = Superblock::parse(buf.as_slice())?;
        sb.validate()?;
        if sb.nr_blocks > dev.block_count() {
            return Err(SfsError::Corruption {
                block: SUPERBLOCK_BLOCK_NO,
                detail: format!(
                    "superblock claims {} blocks but the device has {}",
                    sb.nr_blocks,
                    dev.block_count()
                ),
            });
        }

        let layout = Layout::from_superblock(&sb);
        let ifree = Bitmap::load(
            dev.as_ref(),
            BlockNo(layout.inode_bitmap_start),
            sb.nr_ifree_blocks,
            sb.nr_inodes,
        )?;
        let bfree = Bitmap::load(
            dev.as_ref(),
            BlockNo(layout.block_bitmap_start),
            sb.nr_bfree_blocks,
            sb.nr_blocks,
        )?;

        if ifree.count_free() != sb.nr_free_inodes {
            return Err(SfsError::Corruption {
                block: layout.inode_bitmap_start,
                detail: "free-inode counter does not match the bitmap".into(),
            });
        }
        if bfree.count_free() != sb.nr_free_blocks {
            return Err(SfsError::Corruption {
                block: layout.block_bitmap_start,
                detail: "free-block counter does not match the bitmap".into(),
            });
        }

        debug!(
            target: "sfs::core",
            nr_blocks = sb.nr_blocks,
            nr_inodes = sb.nr_inodes,
            free_blocks = sb.nr_free_blocks,
            free_inodes = sb.nr_free_inodes,
            "mounted"
        );
        Ok(Self {
            dev,
            clock,
            icache,
            state: Mutex::new(MountState {
                sb,
                layout,
                ifree,
                bfree,
            }),
        })
    }

    /// Write back the superblock and bitmap regions and sync the device.
    pub fn flush(&self) -> Result<()> {
        let st = self.state.lock();
        self.dev
            .write_block(BlockNo(SUPERBLOCK_BLOCK_NO), &st.sb.to_block_bytes())?;
        st.ifree.flush(self.dev.as_ref())?;
        st.bfree.flush(self.dev.as_ref())?;
        self.dev.sync()
    }

    /// Current free-block counter.
    #[must_use]
    pub fn nr_free_blocks(&self) -> u32 {
        self.state.lock().sb.nr_free_blocks
    }

    /// Current free-inode counter.
    #[must_use]
    pub fn nr_free_inodes(&self) -> u32 {
        self.state.lock().sb.nr_free_inodes
    }

    /// A copy of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.state.lock().sb
    }

    // ── Inode materialization ────────────────────────────────────────────

    /// Materialize the inode `ino`, through the host cache. The flag is
    /// `true` when the record was read from the inode store (a new cache
    /// slot) and `false` on a cache hit.
    pub fn iget(&self, ino: InodeNo) -> Result<(Inode, bool)> {
        let st = self.state.lock();
        self.load_inode(&st, ino)
    }

    fn load_inode(&self, st: &MountState, ino: InodeNo) -> Result<(Inode, bool)> {
        match self.icache.acquire(ino) {
            CacheSlot::Existing(inode) => Ok((inode, false)),
            CacheSlot::New => {
                let inode = read_inode_record(self.dev.as_ref(), &st.layout, &st.sb, ino)?;
                self.icache.insert(ino, inode);
                Ok((inode, true))
            }
        }
    }

    fn store_inode(&self, st: &MountState, ino: InodeNo, inode: Inode) -> Result<()> {
        write_inode_record(self.dev.as_ref(), &st.layout, ino, &inode)?;
        self.icache.insert(ino, inode);
        Ok(())
    }

    // ── Namespace operations ─────────────────────────────────────────────

    /// Resolve `name` in `dir`. Touches the directory's access time.
    pub fn lookup(&self, dir: InodeNo, name: &str) -> Result<InodeNo> {
        let name_b = check_name(name)?;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let dev = self.dev.as_ref();

        let (mut dir_inode, _) = self.load_inode(st, dir)?;
        require_dir(&dir_inode)?;
        let index = read_index(dev, dir_inode.ei_block)?;
        let found = find_entry(dev, &index, name_b)?;

        dir_inode.atime = self.clock.now_secs();
        self.store_inode(st, dir, dir_inode)?;

        found.ok_or_else(|| SfsError::NotFound(name.to_owned()))
    }

    /// Create a regular file or directory named `name` in `dir`.
    pub fn create(
        &self,
        dir: InodeNo,
        name: &str,
        mode: u32,
        creds: Credentials,
    ) -> Result<InodeNo> {
        match FileKind::from_mode(mode) {
            Some(FileKind::Regular | FileKind::Directory) => {}
            Some(FileKind::Symlink) => {
                return Err(SfsError::Inval("create cannot make symlinks"))
            }
            None => return Err(SfsError::Inval("unsupported file mode")),
        }
        self.create_node(dir, name, mode, creds, None)
    }

    /// Create a directory; `mode` permission bits are kept, the directory
    /// bit is implied.
    pub fn mkdir(&self, dir: InodeNo, name: &str, mode: u32, creds: Credentials) -> Result<InodeNo> {
        self.create_node(
            dir,
            name,
            file_mode::S_IFDIR | (mode & !file_mode::S_IFMT),
            creds,
            None,
        )
    }

    /// Create a symbolic link to `target`, stored inline in the inode.
    pub fn symlink(
        &self,
        dir: InodeNo,
        name: &str,
        target: &str,
        creds: Credentials,
    ) -> Result<InodeNo> {
        self.create_node(
            dir,
            name,
            file_mode::S_IFLNK | 0o777,
            creds,
            Some(target.as_bytes()),
        )
    }

    fn create_node(
        &self,
        dir: InodeNo,
        name: &str,
        mode: u32,
        creds: Credentials,
        target: Option<&[u8]>,
    ) -> Result<InodeNo> {
        let name_b = check_name(name)?;
        let kind = FileKind::from_mode(mode).ok_or(SfsError::Inval("unsupported file mode"))?;
        if let Some(target) = target {
            if target.len() + 1 > SYMLINK_TARGET_MAX {
                return Err(SfsError::NameTooLong);
            }
        }

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let dev = self.dev.as_ref();

        let (mut dir_inode, _) = self.load_inode(st, dir)?;
        require_dir(&dir_inode)?;
        let mut index = read_index(dev, dir_inode.ei_block)?;
        if index.nr_files == MAX_SUBFILES {
            return Err(SfsError::LinkLimit);
        }
        if st.sb.nr_free_inodes == 0 {
            return Err(SfsError::NoSpace);
        }
        if kind != FileKind::Symlink && st.sb.nr_free_blocks == 0 {
            return Err(SfsError::NoSpace);
        }

        let ino = alloc_inode(dev, &mut st.sb, &mut st.ifree)?;

        let ei_block = if kind == FileKind::Symlink {
            0
        } else {
            let bno = match alloc_blocks(dev, &mut st.sb, &mut st.bfree, 1) {
                Ok(bno) => bno,
                Err(err) => {
                    undo_inode(dev, st, ino);
                    return Err(err);
                }
            };
            // Scrub the child's index block so stale data cannot read as
            // extents.
            if let Err(err) = dev.zero_block(bno) {
                undo_blocks(dev, st, bno, 1);
                undo_inode(dev, st, ino);
                return Err(err);
            }
            bno.0
        };

        let now = self.clock.now_secs();
        let mut inode = Inode {
            mode,
            uid: creds.uid,
            gid: creds.gid,
            size: match kind {
                FileKind::Directory => BLOCK_SIZE as u32,
                FileKind::Regular => 0,
                // Targets are capped well below u32 by the inline check.
                FileKind::Symlink => target.map_or(0, |t| t.len() as u32),
            },
            ctime: now,
            atime: now,
            mtime: now,
            blocks: if kind == FileKind::Symlink { 0 } else { 1 },
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            ei_block,
            ..Inode::default()
        };
        if let Some(target) = target {
            inode.set_symlink_target(target)?;
        }

        if let Err(err) = insert_entry(dev, &mut st.sb, &mut st.bfree, &mut index, name_b, ino) {
            if kind != FileKind::Symlink {
                undo_blocks(dev, st, BlockNo(ei_block), 1);
            }
            undo_inode(dev, st, ino);
            return Err(err);
        }
        store_index(dev, dir_inode.ei_block, &index)?;
        self.store_inode(st, ino, inode)?;

        if kind == FileKind::Directory {
            dir_inode.nlink += 1;
        }
        dir_inode.ctime = now;
        dir_inode.atime = now;
        dir_inode.mtime = now;
        self.store_inode(st, dir, dir_inode)?;

        debug!(target: "sfs::core", dir = dir.0, name, ino = ino.0, mode, "created");
        Ok(ino)
    }

    /// Remove `name` from `dir`. The inode is destroyed once its last link
    /// goes: extents scrubbed and released, index block released, record
    /// zeroed.
    pub fn unlink(&self, dir: InodeNo, name: &str) -> Result<()> {
        let name_b = check_name(name)?;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let dev = self.dev.as_ref();

        let (mut dir_inode, _) = self.load_inode(st, dir)?;
        require_dir(&dir_inode)?;
        let mut index = read_index(dev, dir_inode.ei_block)?;
        let child_ino = find_entry(dev, &index, name_b)?
            .ok_or_else(|| SfsError::NotFound(name.to_owned()))?;
        let (mut child, _) = self.load_inode(st, child_ino)?;

        remove_entry(dev, &mut index, name_b, child_ino)?;
        store_index(dev, dir_inode.ei_block, &index)?;

        let now = self.clock.now_secs();
        dir_inode.ctime = now;
        dir_inode.atime = now;
        dir_inode.mtime = now;
        let is_dir = child.kind() == Some(FileKind::Directory);
        if is_dir {
            dir_inode.nlink -= 1;
            child.nlink -= 1;
        }
        self.store_inode(st, dir, dir_inode)?;

        if child.nlink > 1 {
            child.nlink -= 1;
            child.ctime = now;
            self.store_inode(st, child_ino, child)?;
            debug!(target: "sfs::core", dir = dir.0, name, ino = child_ino.0, nlink = child.nlink, "dropped link");
            return Ok(());
        }

        // Last reference: release everything the inode owns. The data
        // blocks are cleared before the bitmap release.
        if child.kind() != Some(FileKind::Symlink) {
            match read_index(dev, child.ei_block) {
                Ok(child_index) => {
                    for (_, extent) in child_index.live_extents() {
                        release_and_scrub(dev, &mut st.sb, &mut st.bfree, extent)?;
                    }
                }
                Err(err) => {
                    // The inode is destroyed regardless; its blocks leak.
                    warn!(
                        target: "sfs::core",
                        ino = child_ino.0,
                        block = child.ei_block,
                        error = %err,
                        "index unreadable during unlink, releasing inode anyway"
                    );
                }
            }
            if let Err(err) = dev.zero_block(BlockNo(child.ei_block)) {
                warn!(
                    target: "sfs::core",
                    block = child.ei_block,
                    error = %err,
                    "ignoring index scrub failure"
                );
            }
            free_blocks(dev, &mut st.sb, &mut st.bfree, BlockNo(child.ei_block), 1)?;
        }

        free_inode(dev, &mut st.sb, &mut st.ifree, child_ino)?;
        write_inode_record(dev, &st.layout, child_ino, &Inode::default())?;
        self.icache.evict(child_ino);

        debug!(target: "sfs::core", dir = dir.0, name, ino = child_ino.0, "unlinked");
        Ok(())
    }

    /// Remove the empty directory `name` from `dir`.
    pub fn rmdir(&self, dir: InodeNo, name: &str) -> Result<()> {
        let name_b = check_name(name)?;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let dev = self.dev.as_ref();

            let (dir_inode, _) = self.load_inode(st, dir)?;
            require_dir(&dir_inode)?;
            let index = read_index(dev, dir_inode.ei_block)?;
            let child_ino = find_entry(dev, &index, name_b)?
                .ok_or_else(|| SfsError::NotFound(name.to_owned()))?;
            let (child, _) = self.load_inode(st, child_ino)?;
            require_dir(&child)?;

            if child.nlink > 2 {
                return Err(SfsError::NotEmpty);
            }
            let child_index = read_index(dev, child.ei_block)?;
            if child_index.nr_files != 0 {
                return Err(SfsError::NotEmpty);
            }
        }
        self.unlink(dir, name)
    }

    /// Add a hard link to `src` under `dir/name`. No new inode, no new
    /// data blocks.
    pub fn link(&self, src: InodeNo, dir: InodeNo, name: &str) -> Result<()> {
        let name_b = check_name(name)?;
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let dev = self.dev.as_ref();

        let (mut src_inode, _) = self.load_inode(st, src)?;
        if src_inode.kind() == Some(FileKind::Directory) {
            return Err(SfsError::Inval("cannot hard-link a directory"));
        }
        let (dir_inode, _) = self.load_inode(st, dir)?;
        require_dir(&dir_inode)?;
        let mut index = read_index(dev, dir_inode.ei_block)?;

        insert_entry(dev, &mut st.sb, &mut st.bfree, &mut index, name_b, src)?;
        store_index(dev, dir_inode.ei_block, &index)?;

        src_inode.nlink += 1;
        src_inode.ctime = self.clock.now_secs();
        self.store_inode(st, src, src_inode)?;

        debug!(target: "sfs::core", dir = dir.0, name, ino = src.0, nlink = src_inode.nlink, "linked");
        Ok(())
    }

    /// Move `olddir/oldname` to `newdir/newname`.
    ///
    /// A colliding target name fails with `Exists`, in the same directory
    /// too. A same-directory rename rewrites the filename in place; a move
    /// inserts into the new parent before removing from the old, adjusting
    /// both parents' link counts when a directory moves.
    pub fn rename(
        &self,
        olddir: InodeNo,
        oldname: &str,
        newdir: InodeNo,
        newname: &str,
        flags: u32,
    ) -> Result<()> {
        if flags & (RENAME_EXCHANGE | RENAME_WHITEOUT) != 0 {
            return Err(SfsError::Inval("unsupported rename flag"));
        }
        let old_b = check_name(oldname)?;
        let new_b = check_name(newname)?;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let dev = self.dev.as_ref();

        let (mut old_dir_inode, _) = self.load_inode(st, olddir)?;
        require_dir(&old_dir_inode)?;
        let mut old_index = read_index(dev, old_dir_inode.ei_block)?;
        let src_ino = find_entry(dev, &old_index, old_b)?
            .ok_or_else(|| SfsError::NotFound(oldname.to_owned()))?;
        let (src, _) = self.load_inode(st, src_ino)?;
        let now = self.clock.now_secs();

        if olddir == newdir {
            if old_b == new_b {
                return Ok(());
            }
            if find_entry(dev, &old_index, new_b)?.is_some() {
                return Err(SfsError::Exists);
            }
            if !rename_entry(dev, &old_index, old_b, new_b)? {
                return Err(SfsError::NotFound(oldname.to_owned()));
            }
            debug!(target: "sfs::core", dir = olddir.0, oldname, newname, "renamed in place");
            return Ok(());
        }

        let (mut new_dir_inode, _) = self.load_inode(st, newdir)?;
        require_dir(&new_dir_inode)?;
        let mut new_index = read_index(dev, new_dir_inode.ei_block)?;
        if find_entry(dev, &new_index, new_b)?.is_some() {
            return Err(SfsError::Exists);
        }

        insert_entry(dev, &mut st.sb, &mut st.bfree, &mut new_index, new_b, src_ino)?;
        store_index(dev, new_dir_inode.ei_block, &new_index)?;

        let moves_dir = src.kind() == Some(FileKind::Directory);
        new_dir_inode.ctime = now;
        new_dir_inode.atime = now;
        new_dir_inode.mtime = now;
        if moves_dir {
            new_dir_inode.nlink += 1;
        }
        self.store_inode(st, newdir, new_dir_inode)?;

        remove_entry(dev, &mut old_index, old_b, src_ino)?;
        store_index(dev, old_dir_inode.ei_block, &old_index)?;

        old_dir_inode.ctime = now;
        old_dir_inode.atime = now;
        old_dir_inode.mtime = now;
        if moves_dir {
            old_dir_inode.nlink -= 1;
        }
        self.store_inode(st, olddir, old_dir_inode)?;

        debug!(
            target: "sfs::core",
            olddir = olddir.0,
            oldname,
            newdir = newdir.0,
            newname,
            ino = src_ino.0,
            "renamed"
        );
        Ok(())
    }
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn check_name(name: &str) -> Result<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(SfsError::Inval("empty filename"));
    }
    if bytes.len() > FILENAME_LEN {
        return Err(SfsError::NameTooLong);
    }
    Ok(bytes)
}

fn require_dir(inode: &Inode) -> Result<()> {
    if inode.kind() == Some(FileKind::Directory) {
        Ok(())
    } else {
        Err(SfsError::Inval("not a directory"))
    }
}

fn read_index(dev: &dyn BlockDevice, ei_block: u32) -> Result<ExtentIndex> {
    let buf = dev.read_block(BlockNo(ei_block))?;
    Ok(ExtentIndex::parse(buf.as_slice())?)
}

fn store_index(dev: &dyn BlockDevice, ei_block: u32, index: &ExtentIndex) -> Result<()> {
    dev.write_block(BlockNo(ei_block), &index.to_block_bytes())
}

fn read_inode_record(
    dev: &dyn BlockDevice,
    layout: &Layout,
    sb: &Superblock,
    ino: InodeNo,
) -> Result<Inode> {
    if ino.0 >= sb.nr_inodes {
        return Err(SfsError::Inval("inode number out of range"));
    }
    let (block, offset) = layout.inode_location(ino);
    let buf = dev.read_block(block)?;
    Ok(Inode::parse(&buf.as_slice()[offset..offset + INODE_RECORD_SIZE])?)
}

fn write_inode_record(
    dev: &dyn BlockDevice,
    layout: &Layout,
    ino: InodeNo,
    inode: &Inode,
) -> Result<()> {
    let (block, offset) = layout.inode_location(ino);
    let mut buf = dev.read_block(block)?;
    buf.as_mut_slice()[offset..offset + INODE_RECORD_SIZE].copy_from_slice(&inode.serialize());
    dev.write_block(block, buf.as_slice())
}

fn undo_inode(dev: &dyn BlockDevice, st: &mut MountState, ino: InodeNo) {
    if let Err(err) = free_inode(dev, &mut st.sb, &mut st.ifree, ino) {
        warn!(target: "sfs::core", ino = ino.0, error = %err, "failed to release inode during undo");
    }
}

fn undo_blocks(dev: &dyn BlockDevice, st: &mut MountState, start: BlockNo, n: u32) {
    if let Err(err) = free_blocks(dev, &mut st.sb, &mut st.bfree, start, n) {
        warn!(target: "sfs::core", block = start.0, error = %err, "failed to release blocks during undo");
    }
}
