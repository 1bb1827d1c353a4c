//! Directory layer
//!
//! A directory is an inode whose data is an array of fixed 32-byte entries:
//! a sector number naming the child's inode record plus a NUL-padded name.
//! A zero sector marks a free slot; `add` reuses the first free slot before
//! growing the directory. There are no stored `.`/`..` entries; the path
//! layer resolves those through the inode parent pointer.

use alloc::string::String;
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromBytes};

use crate::inode::{Inode, Itable};
use crate::{FsError, FsResult};

/// Longest representable name, in bytes
pub const MAX_NAME_LEN: usize = 28;

/// Bytes per on-disk entry
pub const DIR_ENTRY_SIZE: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawEntry {
    inode_sector: u32,
    name: [u8; MAX_NAME_LEN],
}

static_assertions::const_assert_eq!(core::mem::size_of::<RawEntry>(), DIR_ENTRY_SIZE);

impl RawEntry {
    fn free() -> Self {
        Self {
            inode_sector: 0,
            name: [0; MAX_NAME_LEN],
        }
    }

    fn in_use(&self) -> bool {
        self.inode_sector != 0
    }

    fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LEN);
        &self.name[..end]
    }

    fn matches(&self, name: &str) -> bool {
        self.in_use() && self.name_bytes() == name.as_bytes()
    }
}

/// A live directory entry, as reported by [`entries`]
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub sector: u32,
}

fn read_entry(itable: &Itable, dir: &Inode, offset: u64) -> FsResult<RawEntry> {
    let mut buf = [0u8; DIR_ENTRY_SIZE];
    if itable.read_at(dir, &mut buf, offset)? != DIR_ENTRY_SIZE {
        return Err(FsError::InvalidData);
    }
    let mut entry = RawEntry::free();
    entry.as_bytes_mut().copy_from_slice(&buf);
    Ok(entry)
}

fn write_entry(itable: &Itable, dir: &Inode, offset: u64, entry: &RawEntry) -> FsResult<()> {
    if itable.write_at(dir, entry.as_bytes(), offset)? != DIR_ENTRY_SIZE {
        return Err(FsError::NoSpace);
    }
    Ok(())
}

/// Find `name`, returning the child's record sector
pub fn lookup(itable: &Itable, dir: &Inode, name: &str) -> FsResult<Option<u32>> {
    let mut offset = 0u64;
    while offset < dir.length() as u64 {
        let entry = read_entry(itable, dir, offset)?;
        if entry.matches(name) {
            return Ok(Some(entry.inode_sector));
        }
        offset += DIR_ENTRY_SIZE as u64;
    }
    Ok(None)
}

/// Link `sector` under `name`, reusing a free slot or growing the
/// directory, and repoint the child's parent here
pub fn add(itable: &Itable, dir: &Inode, name: &str, sector: u32) -> FsResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidPath);
    }
    let mut slot = dir.length() as u64;
    let mut offset = 0u64;
    while offset < dir.length() as u64 {
        let entry = read_entry(itable, dir, offset)?;
        if entry.matches(name) {
            return Err(FsError::AlreadyExists);
        }
        if !entry.in_use() && slot == dir.length() as u64 {
            slot = offset;
        }
        offset += DIR_ENTRY_SIZE as u64;
    }

    let mut entry = RawEntry::free();
    entry.inode_sector = sector;
    entry.name[..name.len()].copy_from_slice(name.as_bytes());
    write_entry(itable, dir, slot, &entry)?;
    itable.set_parent(sector, dir.inumber())
}

/// Unlink `name`: mark its inode removed (reclaimed at last close) and
/// free the slot. Refuses to unlink a non-empty directory.
pub fn remove(itable: &Itable, dir: &Inode, name: &str) -> FsResult<()> {
    let mut offset = 0u64;
    while offset < dir.length() as u64 {
        let entry = read_entry(itable, dir, offset)?;
        if entry.matches(name) {
            let target = itable.open(entry.inode_sector)?;
            if target.is_dir() && !is_empty(itable, &target)? {
                itable.close(target)?;
                return Err(FsError::NotEmpty);
            }
            write_entry(itable, dir, offset, &RawEntry::free())?;
            target.remove();
            return itable.close(target);
        }
        offset += DIR_ENTRY_SIZE as u64;
    }
    Err(FsError::NotFound)
}

/// List the live entries
pub fn entries(itable: &Itable, dir: &Inode) -> FsResult<Vec<DirEntry>> {
    let mut result = Vec::new();
    let mut offset = 0u64;
    while offset < dir.length() as u64 {
        let entry = read_entry(itable, dir, offset)?;
        if entry.in_use() {
            result.push(DirEntry {
                name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                sector: entry.inode_sector,
            });
        }
        offset += DIR_ENTRY_SIZE as u64;
    }
    Ok(result)
}

/// True when the directory holds no live entries
pub fn is_empty(itable: &Itable, dir: &Inode) -> FsResult<bool> {
    let mut offset = 0u64;
    while offset < dir.length() as u64 {
        if read_entry(itable, dir, offset)?.in_use() {
            return Ok(false);
        }
        offset += DIR_ENTRY_SIZE as u64;
    }
    Ok(true)
}
