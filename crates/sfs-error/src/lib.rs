#![forbid(unsafe_code)]
//! Error types for SimpleFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for a FUSE-style host.

use sfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all SimpleFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(#[from] ParseError),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("no space left on device")]
    NoSpace,

    #[error("directory entry limit reached")]
    LinkLimit,

    #[error("name too long")]
    NameTooLong,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    Inval(&'static str),
}

impl SfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Inval(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::LinkLimit => libc::EMLINK,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
