#![forbid(unsafe_code)]
//! Error types for agfs.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `agfs-types` | Format violations found while decoding bytes |
//! | Runtime | `AgfsError` | `agfs-error` (this crate) | Errors returned by every engine API |
//!
//! `agfs-error` does not depend on `agfs-types`; `ParseError` is converted at
//! the point a block is decoded, where the block number is known:
//!
//! | ParseError while... | AgfsError Variant |
//! |---------------------|-------------------|
//! | decoding live metadata (AG headers, btree blocks) | `Corruption { block, detail }` |
//! | validating the superblock at mount | `Format(detail)` |
//!
//! ## Result classes
//!
//! - **Resource exhaustion** (`NoSpace`, `QuotaExceeded`, `LogSpace`): expected,
//!   non-corrupting, caller-retriable. "No space in this allocation group" is not
//!   an error at all; allocators return `Ok(None)` and let the caller move on.
//! - **Structural corruption** (`Corruption`): aborts the transaction and, when the
//!   structure was about to be trusted for allocation, shuts the filesystem down.
//! - **I/O** (`Io`): fatal to the enclosing transaction; fatal to the filesystem
//!   when it hits the log.
//! - **Shutdown**: every operation after a forced shutdown.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`AgfsError::to_errno`].
//! The match is exhaustive so a new variant cannot ship without an errno.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidArgument` | `EINVAL` |
//! | `NoSpace` / `LogSpace` | `ENOSPC` |
//! | `QuotaExceeded` | `EDQUOT` |
//! | `ReservationOverrun` | `EIO` |
//! | `Shutdown` | `EIO` |
//! | `ReadOnly` | `EROFS` |
//! | `NotFound` | `ENOENT` |
//! | `Busy` | `EBUSY` |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// `block` is the absolute block address of the structure that failed
    /// verification so the diagnostic names a location.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format found during mount-time validation.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Geometry out of the supported range (block size, AG size, inode size).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller passed an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free blocks or inodes available anywhere.
    #[error("no space left on device")]
    NoSpace,

    /// A dquot hard limit would be exceeded.
    #[error("disk quota exceeded: {kind} id {id}")]
    QuotaExceeded { kind: &'static str, id: u32 },

    /// Log space could not be granted within the configured wait.
    #[error("log space exhausted: need {needed} bytes")]
    LogSpace { needed: u64 },

    /// A transaction consumed more of a resource than it reserved.
    #[error("{resource} reservation overrun: reserved {reserved}, requested {requested}")]
    ReservationOverrun {
        resource: &'static str,
        reserved: u64,
        requested: u64,
    },

    /// The filesystem was shut down after a durability-threatening error.
    #[error("filesystem shut down")]
    Shutdown,

    /// A write was attempted on a read-only instance.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object is locked by another committer and the caller asked not to wait.
    #[error("resource busy: {0}")]
    Busy(String),
}

impl AgfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::ReservationOverrun { .. } | Self::Shutdown => {
                libc::EIO
            }
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace | Self::LogSpace { .. } => libc::ENOSPC,
            Self::QuotaExceeded { .. } => libc::EDQUOT,
            Self::ReadOnly => libc::EROFS,
            Self::NotFound(_) => libc::ENOENT,
            Self::Busy(_) => libc::EBUSY,
        }
    }

    /// Structural corruption: the instance can no longer be trusted for writes.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Expected exhaustion that leaves the filesystem consistent.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::NoSpace | Self::QuotaExceeded { .. } | Self::LogSpace { .. }
        )
    }

    /// Shorthand used by verifiers.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `AgfsError`.
pub type Result<T> = std::result::Result<T, AgfsError>;
