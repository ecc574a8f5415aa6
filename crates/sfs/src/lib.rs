#![forbid(unsafe_code)]
//! SimpleFS public API facade.
//!
//! Re-exports the mount handle and the types a host needs to drive it.

pub use sfs_block::{BlockBuf, BlockDevice, FileBlockDevice, MemBlockDevice};
pub use sfs_core::*;
pub use sfs_error::{Result, SfsError};
pub use sfs_ondisk::{FileKind, Inode, Superblock};
pub use sfs_types::{BlockNo, InodeNo};
