//! File system top level
//!
//! Owns the pieces (device, cache, free map, open-inode table), validates
//! or formats the superblock at mount, resolves slash-separated paths, and
//! exposes create/open/remove. `.` stays in place, `..` follows the inode's
//! parent pointer; paths are resolved from the root.
//!
//! The write-behind thread is the embedder's to run: spawn
//! `fs.cache().write_behind(timer, interval)` after mount and join it after
//! `shutdown`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufferCache;
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::dir;
use crate::freemap::{FreeMap, BITMAP_SECTORS, BITMAP_START_SECTOR};
use crate::inode::{Inode, Itable};
use crate::{FsError, FsResult};

pub const SUPERBLOCK_SECTOR: u32 = 0;

/// The root directory record sits right after the free-map bitmap
pub const ROOT_DIR_SECTOR: u32 = BITMAP_START_SECTOR + BITMAP_SECTORS;

/// "CLKF"
const FS_MAGIC: u32 = 0x434C_4B46;
const FS_VERSION: u32 = 1;

/// On-disk superblock, stored at the front of sector 0
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct Superblock {
    magic: u32,
    version: u32,
    sector_count: u32,
    bitmap_start: u32,
    bitmap_sectors: u32,
    root_sector: u32,
}

const_assert_eq!(core::mem::size_of::<Superblock>(), 24);

impl Superblock {
    fn new(sector_count: u32) -> Self {
        Self {
            magic: FS_MAGIC,
            version: FS_VERSION,
            sector_count,
            bitmap_start: BITMAP_START_SECTOR,
            bitmap_sectors: BITMAP_SECTORS,
            root_sector: ROOT_DIR_SECTOR,
        }
    }

    fn is_valid(&self, sector_count: u32) -> bool {
        self.magic == FS_MAGIC
            && self.version == FS_VERSION
            && self.sector_count == sector_count
            && self.bitmap_start == BITMAP_START_SECTOR
            && self.bitmap_sectors == BITMAP_SECTORS
            && self.root_sector == ROOT_DIR_SECTOR
    }
}

/// A mounted file system
pub struct FileSys {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BufferCache>,
    freemap: Arc<Mutex<FreeMap>>,
    itable: Itable,
}

impl FileSys {
    /// Mount `device`, formatting it first when `format` is set. Without
    /// `format` the superblock must already describe this device.
    pub fn mount(device: Arc<dyn BlockDevice>, format: bool) -> FsResult<Self> {
        let sectors = device.sector_count();
        if sectors <= ROOT_DIR_SECTOR {
            crate::log_error!("[clockfs] device too small: {} sectors", sectors);
            return Err(FsError::InvalidData);
        }

        let cache = Arc::new(BufferCache::new(device.clone()));
        let freemap = if format {
            let mut map = FreeMap::new(sectors);
            for sector in 0..=ROOT_DIR_SECTOR {
                map.mark_used(sector);
            }
            Arc::new(Mutex::new(map))
        } else {
            let sb = Self::read_superblock(&*device)?;
            if !sb.is_valid(sectors) {
                crate::log_error!("[clockfs] bad superblock on {}-sector device", sectors);
                return Err(FsError::InvalidData);
            }
            crate::log_debug!("[clockfs] found existing file system, {} sectors", sectors);
            Arc::new(Mutex::new(FreeMap::load(&*device, sectors)?))
        };

        let itable = Itable::new(device.clone(), cache.clone(), freemap.clone());
        let fs = Self {
            device,
            cache,
            freemap,
            itable,
        };

        if format {
            crate::log!("[clockfs] formatting {} sectors...", sectors);
            fs.itable.create(ROOT_DIR_SECTOR, 0, true)?;
            fs.write_superblock(&Superblock::new(sectors))?;
            fs.freemap.lock().store(&*fs.device)?;
        }

        Ok(fs)
    }

    /// The shared buffer cache (run `write_behind` on it)
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    /// Sectors still unallocated
    pub fn free_sectors(&self) -> u32 {
        self.freemap.lock().free_count()
    }

    /// Create a file (or directory) of `initial_size` bytes at `path`
    pub fn create(&self, path: &str, initial_size: i32, isdir: bool) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if name.is_empty() || name == "." || name == ".." {
            self.itable.close(parent)?;
            return Err(FsError::InvalidPath);
        }

        let sector = match self.freemap.lock().allocate() {
            Some(sector) => sector,
            None => {
                self.itable.close(parent)?;
                return Err(FsError::NoSpace);
            }
        };
        let result = self
            .itable
            .create(sector, initial_size, isdir)
            .and_then(|()| dir::add(&self.itable, &parent, name, sector));
        if result.is_err() {
            // the record sector comes back; data sectors of a partial
            // allocation stay lost, as documented
            self.freemap.lock().release(sector);
            self.cache.discard(sector);
        }
        self.itable.close(parent)?;
        result
    }

    /// Open the inode at `path`. The handle is shared with every other
    /// opener and must be returned via `itable().close()`.
    pub fn open(&self, path: &str) -> FsResult<Arc<Inode>> {
        let mut current = self.itable.open(ROOT_DIR_SECTOR)?;
        for component in components(path) {
            current = self.step(current, component)?;
        }
        Ok(current)
    }

    /// Remove the file or empty directory at `path`
    pub fn remove(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if name.is_empty() || name == "." || name == ".." {
            self.itable.close(parent)?;
            return Err(FsError::InvalidPath);
        }
        let result = dir::remove(&self.itable, &parent, name);
        self.itable.close(parent)?;
        result
    }

    /// Persist the free map, stop write-behind and flush everything.
    /// Callers close their inode handles first.
    pub fn shutdown(self) -> FsResult<()> {
        self.freemap.lock().store(&*self.device)?;
        self.cache.shutdown()?;
        crate::log!("[clockfs] unmounted");
        Ok(())
    }

    /// Walk to the directory containing `path`'s last component
    fn resolve_parent<'p>(&self, path: &'p str) -> FsResult<(Arc<Inode>, &'p str)> {
        let parts: Vec<&str> = components(path).collect();
        let (last, dirs) = match parts.split_last() {
            Some(split) => split,
            None => return Ok((self.itable.open(ROOT_DIR_SECTOR)?, "")),
        };
        let mut current = self.itable.open(ROOT_DIR_SECTOR)?;
        for &component in dirs {
            current = self.step(current, component)?;
        }
        if !current.is_dir() {
            self.itable.close(current)?;
            return Err(FsError::NotDirectory);
        }
        Ok((current, last))
    }

    /// Resolve one path component from `current`, consuming the handle
    fn step(&self, current: Arc<Inode>, component: &str) -> FsResult<Arc<Inode>> {
        if component == "." {
            return Ok(current);
        }
        if component == ".." {
            let parent = current.parent();
            let next = self.itable.open(parent)?;
            self.itable.close(current)?;
            return Ok(next);
        }
        if !current.is_dir() {
            self.itable.close(current)?;
            return Err(FsError::NotDirectory);
        }
        match dir::lookup(&self.itable, &current, component)? {
            Some(sector) => {
                let next = self.itable.open(sector)?;
                self.itable.close(current)?;
                Ok(next)
            }
            None => {
                self.itable.close(current)?;
                Err(FsError::NotFound)
            }
        }
    }

    fn read_superblock(device: &dyn BlockDevice) -> FsResult<Superblock> {
        let mut buf = [0u8; SECTOR_SIZE];
        device.read_sector(SUPERBLOCK_SECTOR, &mut buf)?;
        let mut sb = Superblock::new(0);
        let len = core::mem::size_of::<Superblock>();
        sb.as_bytes_mut().copy_from_slice(&buf[..len]);
        Ok(sb)
    }

    fn write_superblock(&self, sb: &Superblock) -> FsResult<()> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[..core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
        self.device.write_sector(SUPERBLOCK_SECTOR, &buf)
    }
}

/// Path components, with empty segments stripped ("//a/" walks like "a")
fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}
