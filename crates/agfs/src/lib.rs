#![forbid(unsafe_code)]
//! agfs public API facade.
//!
//! Re-exports the mounted-volume API of `agfs-core` together with the block
//! devices it runs on: [`format`] a device, [`Filesystem::mount`] it, then
//! allocate and free extents and inodes through transactions that keep the
//! per-AG trees, the summary counters and the quota usage in step.

pub use agfs_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemBlockDevice, MemByteDevice,
};
pub use agfs_core::*;
