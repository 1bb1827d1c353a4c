//! Inodes
//!
//! An inode describes one unnamed file or directory. The on-disk record
//! occupies exactly one sector: twelve block slots (ten direct, one
//! indirect, one doubly-indirect), the parent directory's sector, a
//! directory flag, the byte length, and a magic number. Capacity is
//! 10 + 128 + 128*128 = 16,522 data sectors per inode.
//!
//! The in-memory side is the open-inode table ([`Itable`]): at most one
//! `Inode` exists per on-disk sector, shared by every opener and
//! reference-counted by `open_cnt`. The last close writes the record back,
//! or, if the inode was removed, returns the record sector and every
//! reachable data and indirect sector to the free map.
//!
//! All data traffic and every indirect-block access goes through the buffer
//! cache, so concurrent readers and writers observe a single view. Inode
//! records themselves are read at `open` and written at final `close`
//! directly against the device.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufferCache;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::freemap::FreeMap;
use crate::fs::ROOT_DIR_SECTOR;
use crate::{FsError, FsResult};

/// Identifies a sector written by this engine
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// Direct block slots per record
pub const DIRECT_SLOTS: usize = 10;

const SLOT_INDIRECT: usize = 10;
const SLOT_DOUBLE: usize = 11;

/// Sector numbers per indirect block
pub const PTRS_PER_BLOCK: usize = SECTOR_SIZE / 4;

/// Largest file the index can address
pub const MAX_FILE_SECTORS: usize =
    DIRECT_SLOTS + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK;
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// On-disk inode record. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DiskInode {
    /// 0-9 direct, 10 indirect, 11 doubly-indirect
    blocks: [u32; 12],
    /// Sector of the containing directory's record (root points to itself)
    parent: u32,
    /// Non-zero when this inode is a directory
    isdir: u32,
    /// File size in bytes
    length: i32,
    magic: u32,
    unused: [u32; 112],
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

impl DiskInode {
    fn new(isdir: bool, parent: u32) -> Self {
        Self {
            blocks: [0; 12],
            parent,
            isdir: isdir as u32,
            length: 0,
            magic: INODE_MAGIC,
            unused: [0; 112],
        }
    }

    fn zeroed() -> Self {
        Self {
            blocks: [0; 12],
            parent: 0,
            isdir: 0,
            length: 0,
            magic: 0,
            unused: [0; 112],
        }
    }
}

/// One sector full of sector numbers
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndirectBlock {
    slots: [u32; 128],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    fn empty() -> Self {
        Self { slots: [0; 128] }
    }
}

/// Sectors needed to hold `length` bytes
fn bytes_to_sectors(length: i32) -> usize {
    (length as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}

struct InodeState {
    open_cnt: u32,
    deny_write_cnt: u32,
    removed: bool,
    disk: DiskInode,
}

/// An open inode. Obtained from [`Itable::open`]; all openers of the same
/// sector share one `Inode`.
pub struct Inode {
    sector: u32,
    state: Mutex<InodeState>,
}

impl Inode {
    /// Sector number of the on-disk record
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> i32 {
        self.state.lock().disk.length
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().disk.isdir != 0
    }

    pub fn parent(&self) -> u32 {
        self.state.lock().disk.parent
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().open_cnt
    }

    /// Mark for deletion; blocks are reclaimed at the final close
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    /// Disable writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(
            state.deny_write_cnt <= state.open_cnt,
            "deny-write count exceeds open count"
        );
    }

    /// Re-enable writes. Must pair with an earlier `deny_write`.
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0, "allow_write without deny_write");
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }
}

/// Open-inode table plus the engine operating on records through the cache
pub struct Itable {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BufferCache>,
    freemap: Arc<Mutex<FreeMap>>,
    open: Mutex<BTreeMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        cache: Arc<BufferCache>,
        freemap: Arc<Mutex<FreeMap>>,
    ) -> Self {
        Self {
            device,
            cache,
            freemap,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Write a fresh inode record at `sector`, allocating and zeroing enough
    /// data sectors to cover `length` bytes. The caller owns `sector` (it
    /// came from the free map). On allocator exhaustion the partial
    /// allocation is not rolled back and the record is not written.
    pub fn create(&self, sector: u32, length: i32, isdir: bool) -> FsResult<()> {
        assert!(length >= 0);
        let mut disk = DiskInode::new(isdir, ROOT_DIR_SECTOR);
        if length > 0 {
            self.extend_record(&mut disk, length)?;
        }
        self.cache.discard(sector);
        self.write_record(sector, &disk)
    }

    /// Open the inode at `sector`, or hand out the already-open one
    pub fn open(&self, sector: u32) -> FsResult<Arc<Inode>> {
        let mut open = self.open.lock();
        if let Some(inode) = open.get(&sector) {
            inode.state.lock().open_cnt += 1;
            return Ok(Arc::clone(inode));
        }
        let disk = self.read_record(sector)?;
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(InodeState {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
                disk,
            }),
        });
        open.insert(sector, Arc::clone(&inode));
        Ok(inode)
    }

    /// Take another reference to an already-open inode
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.state.lock().open_cnt += 1;
        Arc::clone(inode)
    }

    /// Drop one reference. The last close unregisters the inode, then either
    /// reclaims everything (if removed) or writes the record back.
    pub fn close(&self, inode: Arc<Inode>) -> FsResult<()> {
        let mut open = self.open.lock();
        let mut state = inode.state.lock();
        assert!(state.open_cnt > 0, "close without matching open");
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return Ok(());
        }
        open.remove(&inode.sector);
        drop(open);

        if state.removed {
            self.release_blocks(&state.disk)?;
            self.freemap.lock().release(inode.sector);
            self.cache.discard(inode.sector);
            Ok(())
        } else {
            self.write_record(inode.sector, &state.disk)
        }
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read, short at end of file.
    pub fn read_at(&self, inode: &Inode, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let state = inode.state.lock();
        let length = state.disk.length as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            if pos >= length {
                break;
            }
            let sector = match self.byte_to_sector(&state.disk, pos)? {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (buf.len() - done)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_ofs);

            let handle = self.cache.acquire(sector)?;
            self.cache.copy_out(&handle, sector_ofs, &mut buf[done..done + chunk]);
            self.cache.release(handle, true, false);

            done += chunk;
        }
        Ok(done)
    }

    /// Write `buf` starting at byte `offset`, growing the file first when
    /// the write lands past end of file. Returns the number of bytes
    /// written, short when the free map runs out mid-growth. Returns 0
    /// without side effects while writes are denied.
    pub fn write_at(&self, inode: &Inode, buf: &[u8], offset: u64) -> FsResult<usize> {
        let mut state = inode.state.lock();
        if state.deny_write_cnt > 0 {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(MAX_FILE_BYTES as u64);
        if end > state.disk.length as u64 {
            match self.extend_record(&mut state.disk, end as i32) {
                Ok(()) => {}
                Err(FsError::NoSpace) => {
                    crate::log_warn!(
                        "growth to {} bytes fell short, inode {} stays at {}",
                        end,
                        inode.sector,
                        state.disk.length
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let length = state.disk.length as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            if pos >= length {
                break;
            }
            let sector = match self.byte_to_sector(&state.disk, pos)? {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (buf.len() - done)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_ofs);

            let handle = self.cache.acquire(sector)?;
            self.cache.copy_in(&handle, sector_ofs, &buf[done..done + chunk]);
            self.cache.release(handle, true, true);

            done += chunk;
        }
        Ok(done)
    }

    /// Repoint `child`'s parent directory and persist it through the
    /// open/close path
    pub fn set_parent(&self, child: u32, parent: u32) -> FsResult<()> {
        let inode = self.open(child)?;
        inode.state.lock().disk.parent = parent;
        self.close(inode)
    }

    /// Number of inodes currently open (diagnostics)
    pub fn open_inodes(&self) -> usize {
        self.open.lock().len()
    }

    /// Sector holding byte `pos`, or None past end of file. Indirect
    /// lookups go through the cache so they see in-flight growth.
    fn byte_to_sector(&self, disk: &DiskInode, pos: u64) -> FsResult<Option<u32>> {
        if pos >= disk.length as u64 {
            return Ok(None);
        }
        let mut index = (pos / SECTOR_SIZE as u64) as usize;
        if index < DIRECT_SLOTS {
            return Ok(Some(disk.blocks[index]));
        }
        index -= DIRECT_SLOTS;
        if index < PTRS_PER_BLOCK {
            let indirect = self.read_indirect(disk.blocks[SLOT_INDIRECT])?;
            return Ok(Some(indirect.slots[index]));
        }
        index -= PTRS_PER_BLOCK;
        let first = self.read_indirect(disk.blocks[SLOT_DOUBLE])?;
        let second = self.read_indirect(first.slots[index / PTRS_PER_BLOCK])?;
        Ok(Some(second.slots[index % PTRS_PER_BLOCK]))
    }

    /// Grow `disk` to cover `new_length` bytes, filling direct slots, then
    /// the indirect block, then the doubly-indirect tree row-major. Every
    /// new data sector is zeroed on the device. On exhaustion `length` is
    /// set to exactly the allocated prefix, any indirect images touched so
    /// far are already written back, and `NoSpace` is returned.
    fn extend_record(&self, disk: &mut DiskInode, new_length: i32) -> FsResult<()> {
        let old_sectors = bytes_to_sectors(disk.length);
        let target_sectors = bytes_to_sectors(new_length);
        let mut need = target_sectors.saturating_sub(old_sectors);
        if need == 0 {
            disk.length = new_length;
            return Ok(());
        }
        let mut filled = old_sectors;
        let mut exhausted = false;

        while filled < DIRECT_SLOTS && need > 0 {
            match self.alloc_zeroed()? {
                Some(sector) => {
                    disk.blocks[filled] = sector;
                    filled += 1;
                    need -= 1;
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if !exhausted && need > 0 && filled < DIRECT_SLOTS + PTRS_PER_BLOCK {
            let fresh = filled == DIRECT_SLOTS;
            if fresh {
                match self.freemap.lock().allocate() {
                    Some(sector) => disk.blocks[SLOT_INDIRECT] = sector,
                    None => exhausted = true,
                }
            }
            if !exhausted {
                let mut indirect = if fresh {
                    IndirectBlock::empty()
                } else {
                    self.read_indirect(disk.blocks[SLOT_INDIRECT])?
                };
                let mut idx = filled - DIRECT_SLOTS;
                while idx < PTRS_PER_BLOCK && need > 0 {
                    match self.alloc_zeroed()? {
                        Some(sector) => {
                            indirect.slots[idx] = sector;
                            idx += 1;
                            filled += 1;
                            need -= 1;
                        }
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
                self.write_indirect(disk.blocks[SLOT_INDIRECT], &indirect)?;
            }
        }

        if !exhausted && need > 0 {
            let base = filled - DIRECT_SLOTS - PTRS_PER_BLOCK;
            let mut k = base / PTRS_PER_BLOCK;
            let mut l = base % PTRS_PER_BLOCK;
            if base == 0 {
                match self.freemap.lock().allocate() {
                    Some(sector) => disk.blocks[SLOT_DOUBLE] = sector,
                    None => exhausted = true,
                }
            }
            if !exhausted {
                let mut first = if base == 0 {
                    IndirectBlock::empty()
                } else {
                    self.read_indirect(disk.blocks[SLOT_DOUBLE])?
                };
                while k < PTRS_PER_BLOCK && need > 0 {
                    let mut second = if l == 0 {
                        match self.freemap.lock().allocate() {
                            Some(sector) => {
                                first.slots[k] = sector;
                                IndirectBlock::empty()
                            }
                            None => break,
                        }
                    } else {
                        self.read_indirect(first.slots[k])?
                    };
                    let mut failed = false;
                    while l < PTRS_PER_BLOCK && need > 0 {
                        match self.alloc_zeroed()? {
                            Some(sector) => {
                                second.slots[l] = sector;
                                l += 1;
                                need -= 1;
                            }
                            None => {
                                failed = true;
                                break;
                            }
                        }
                    }
                    self.write_indirect(first.slots[k], &second)?;
                    if failed {
                        break;
                    }
                    k += 1;
                    l = 0;
                }
                self.write_indirect(disk.blocks[SLOT_DOUBLE], &first)?;
            }
        }

        if need > 0 {
            disk.length = new_length - (need * SECTOR_SIZE) as i32;
            Err(FsError::NoSpace)
        } else {
            disk.length = new_length;
            Ok(())
        }
    }

    /// Free every sector reachable from `disk`: data sectors in index
    /// order, plus the indirect blocks that carried them
    fn release_blocks(&self, disk: &DiskInode) -> FsResult<()> {
        let mut remaining = bytes_to_sectors(disk.length);

        let mut i = 0;
        while i < DIRECT_SLOTS && remaining > 0 {
            self.free_sector(disk.blocks[i]);
            i += 1;
            remaining -= 1;
        }

        if remaining > 0 {
            let indirect = self.read_indirect(disk.blocks[SLOT_INDIRECT])?;
            let mut j = 0;
            while j < PTRS_PER_BLOCK && remaining > 0 {
                self.free_sector(indirect.slots[j]);
                j += 1;
                remaining -= 1;
            }
            self.free_sector(disk.blocks[SLOT_INDIRECT]);
        }

        if remaining > 0 {
            let first = self.read_indirect(disk.blocks[SLOT_DOUBLE])?;
            let mut k = 0;
            while k < PTRS_PER_BLOCK && remaining > 0 {
                let second = self.read_indirect(first.slots[k])?;
                let mut l = 0;
                while l < PTRS_PER_BLOCK && remaining > 0 {
                    self.free_sector(second.slots[l]);
                    l += 1;
                    remaining -= 1;
                }
                self.free_sector(first.slots[k]);
                k += 1;
            }
            self.free_sector(disk.blocks[SLOT_DOUBLE]);
        }

        Ok(())
    }

    /// Allocate a data sector and zero it on the device. A stale cache
    /// entry from the sector's previous life is discarded first so the
    /// cache cannot shadow the fresh contents.
    fn alloc_zeroed(&self) -> FsResult<Option<u32>> {
        let sector = match self.freemap.lock().allocate() {
            Some(sector) => sector,
            None => return Ok(None),
        };
        self.cache.discard(sector);
        self.device.write_sector(sector, &ZERO_SECTOR)?;
        Ok(Some(sector))
    }

    /// Return a sector to the free map and drop any cached image of it
    fn free_sector(&self, sector: u32) {
        self.freemap.lock().release(sector);
        self.cache.discard(sector);
    }

    fn read_indirect(&self, sector: u32) -> FsResult<IndirectBlock> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read_sector(sector, &mut buf)?;
        let mut block = IndirectBlock::empty();
        block.as_bytes_mut().copy_from_slice(&buf);
        Ok(block)
    }

    fn write_indirect(&self, sector: u32, block: &IndirectBlock) -> FsResult<()> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(block.as_bytes());
        self.cache.write_sector(sector, &buf)
    }

    fn read_record(&self, sector: u32) -> FsResult<DiskInode> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read_sector(sector, &mut buf)?;
        let mut disk = DiskInode::zeroed();
        disk.as_bytes_mut().copy_from_slice(&buf);
        assert_eq!(
            disk.magic, INODE_MAGIC,
            "not an inode record: sector {}",
            sector
        );
        Ok(disk)
    }

    fn write_record(&self, sector: u32, disk: &DiskInode) -> FsResult<()> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(disk.as_bytes());
        self.device.write_sector(sector, &buf)
    }
}
