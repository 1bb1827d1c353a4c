//! Block device interface
//!
//! Everything on disk is addressed in fixed 512-byte sectors by a 32-bit
//! sector number. The traits here are what the file system consumes from
//! its environment: synchronous sector I/O and a blocking timer for the
//! write-behind thread. `MemDisk` is the RAM-backed reference device used
//! by the tests and by embedders without real storage.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{FsError, FsResult};

/// Disk sector size in bytes
pub const SECTOR_SIZE: usize = 512;

/// Synchronous sector-granular storage
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors on the device
    fn sector_count(&self) -> u32;

    /// Read one sector into `buf`
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> FsResult<()>;

    /// Write one sector from `buf`
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> FsResult<()>;
}

/// Blocking sleep, consumed by the write-behind loop
pub trait Timer: Send + Sync {
    fn sleep(&self, ticks: u64);
}

/// RAM-backed block device
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    sectors: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// (sectors read, sectors written) since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> FsResult<()> {
        if sector >= self.sectors {
            return Err(FsError::Io);
        }
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> FsResult<()> {
        if sector >= self.sectors {
            return Err(FsError::Io);
        }
        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let disk = MemDisk::new(8);
        let mut out = [0u8; SECTOR_SIZE];
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xAB;
        sector[511] = 0xCD;

        disk.write_sector(3, &sector).unwrap();
        disk.read_sector(3, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[511], 0xCD);
        assert_eq!(disk.stats(), (1, 1));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read_sector(4, &mut buf), Err(FsError::Io));
        assert_eq!(disk.write_sector(100, &buf), Err(FsError::Io));
    }

    #[test]
    fn test_fresh_disk_reads_zero() {
        let disk = MemDisk::new(2);
        let mut buf = [0xFFu8; SECTOR_SIZE];
        disk.read_sector(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
