#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait plus a file-backed implementation with
//! pread/pwrite semantics and an in-memory device for tests and tools. A
//! write through the trait is the dirty-marking hook: written blocks stay
//! dirty in the device layer until `sync`.

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::{BlockNo, BLOCK_SIZE};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Block buffer ─────────────────────────────────────────────────────────────

/// Owned buffer holding exactly one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Box<[u8; BLOCK_SIZE]>,
}

impl BlockBuf {
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: Box::new([0_u8; BLOCK_SIZE]),
        }
    }

    /// Copy `data` into a fresh buffer. `data` must be exactly one block.
    pub fn copy_from(data: &[u8]) -> Result<Self> {
        if data.len() != BLOCK_SIZE {
            return Err(SfsError::Inval("block buffer must be BLOCK_SIZE bytes"));
        }
        let mut buf = Self::zeroed();
        buf.bytes.copy_from_slice(data);
        Ok(buf)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }
}

impl Default for BlockBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

// ── Device trait ─────────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNo) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `BLOCK_SIZE`.
    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Overwrite a block with zeroes.
    fn zero_block(&self, block: BlockNo) -> Result<()> {
        self.write_block(block, &[0_u8; BLOCK_SIZE])
    }
}

fn check_block_range(block: BlockNo, count: u32) -> Result<()> {
    if block.0 >= count {
        return Err(SfsError::Corruption {
            block: block.0,
            detail: format!("block out of range (device has {count} blocks)"),
        });
    }
    Ok(())
}

fn check_write_len(data: &[u8]) -> Result<()> {
    if data.len() != BLOCK_SIZE {
        return Err(SfsError::Inval("write_block requires BLOCK_SIZE bytes"));
    }
    Ok(())
}

// ── File-backed device ───────────────────────────────────────────────────────

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_count: u32,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an existing image, read-write when permitted, falling back to
    /// read-only. The image length must be block-aligned.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_count = Self::blocks_from_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            block_count,
            writable,
        })
    }

    /// Create (or truncate) an image of `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(block_count) * BLOCK_SIZE as u64)?;
        Ok(Self {
            file: Arc::new(file),
            block_count,
            writable: true,
        })
    }

    fn blocks_from_len(len: u64) -> Result<u32> {
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(SfsError::Inval("image length is not block-aligned"));
        }
        u32::try_from(len / BLOCK_SIZE as u64)
            .map_err(|_| SfsError::Inval("image too large for 32-bit block numbers"))
    }

    fn byte_offset(block: BlockNo) -> u64 {
        u64::from(block.0) * BLOCK_SIZE as u64
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNo) -> Result<BlockBuf> {
        check_block_range(block, self.block_count)?;
        let mut buf = BlockBuf::zeroed();
        self.file
            .read_exact_at(buf.as_mut_slice(), Self::byte_offset(block))?;
        trace!(target: "sfs::block", event = "read", block = block.0);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        check_block_range(block, self.block_count)?;
        check_write_len(data)?;
        if !self.writable {
            return Err(SfsError::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        self.file.write_all_at(data, Self::byte_offset(block))?;
        trace!(target: "sfs::block", event = "write", block = block.0);
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── In-memory device ─────────────────────────────────────────────────────────

/// In-memory block device for tests and tools. Blocks never written read
/// back as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_count: u32,
    blocks: Mutex<HashMap<u32, BlockBuf>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        Self {
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNo) -> Result<BlockBuf> {
        check_block_range(block, self.block_count)?;
        let blocks = self.blocks.lock();
        Ok(blocks.get(&block.0).cloned().unwrap_or_default())
    }

    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        check_block_range(block, self.block_count)?;
        check_write_len(data)?;
        self.blocks.lock().insert(block.0, BlockBuf::copy_from(data)?);
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
