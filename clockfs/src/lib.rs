//! clockfs - inode file system core
//!
//! An inode-based file store over a fixed-size block device of 512-byte
//! sectors. All on-disk traffic funnels through a bounded write-back buffer
//! cache with clock eviction; files grow sparsely through direct, indirect
//! and doubly-indirect block indexing.
//!
//! Layering, bottom up:
//! - [`device`]: the `BlockDevice` and `Timer` traits plus `MemDisk`
//! - [`freemap`]: free-sector bitmap, persisted in reserved sectors
//! - [`cache`]: the 64-slot buffer cache and its write-behind loop
//! - [`inode`]: on-disk inode records and the open-inode table
//! - [`dir`]: directory entries stored in directory inodes
//! - [`fs`]: superblock, mount/format and the path-level API
//!
//! The crate is `no_std` + `alloc`; unit tests run hosted against `MemDisk`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cache;
pub mod device;
pub mod dir;
pub mod freemap;
pub mod fs;
pub mod inode;
pub mod logger;

pub use cache::BufferCache;
pub use device::{BlockDevice, MemDisk, Timer, SECTOR_SIZE};
pub use freemap::FreeMap;
pub use fs::FileSys;
pub use inode::{Inode, Itable};

/// Error type shared by every layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    InvalidPath,
    InvalidData,
    NoSpace,
    Io,
}

pub type FsResult<T> = Result<T, FsError>;
