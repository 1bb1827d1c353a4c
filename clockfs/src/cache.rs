//! Buffer cache
//!
//! A bounded write-back cache of sector images sitting between the inode
//! layer and the block device. At most [`CACHE_SLOTS`] sectors are resident
//! at a time; a clock sweep picks the victim when a miss needs room.
//!
//! Usage contract:
//! - `acquire` pins a sector image in memory; every `acquire` must be paired
//!   with exactly one `release`, which also records whether the caller read
//!   or wrote the image.
//! - A pinned entry is never evicted, so `copy_out`/`copy_in` between the
//!   pair are safe against concurrent misses.
//! - Dirty images are written back on eviction, by the periodic
//!   `write_behind` sweep, and at `shutdown`. Until then the cached image,
//!   not the device, is the authoritative content of the sector.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::device::{BlockDevice, Timer, SECTOR_SIZE};
use crate::FsResult;

/// Resident-entry bound
pub const CACHE_SLOTS: usize = 64;

/// Default ticks between write-behind sweeps
pub const WRITE_BEHIND_INTERVAL: u64 = 600;

/// A pinned sector image. Must be given back via [`BufferCache::release`].
pub struct CacheHandle {
    sector: u32,
}

impl CacheHandle {
    pub fn sector(&self) -> u32 {
        self.sector
    }
}

struct Slot {
    data: [u8; SECTOR_SIZE],
    accessed: bool,
    dirty: bool,
    pins: u32,
}

struct CacheState {
    /// Resident entries, keyed (and clock-ordered) by sector number
    slots: BTreeMap<u32, Slot>,
    /// Clock hand: the sweep resumes at the first entry at or after this
    /// sector and wraps to the lowest entry past the end
    hand: u32,
}

pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    state: Mutex<CacheState>,
    running: AtomicBool,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(CacheState {
                slots: BTreeMap::new(),
                hand: 0,
            }),
            running: AtomicBool::new(true),
        }
    }

    /// Pin `sector`'s image in the cache, loading it from the device on a
    /// miss (evicting first when full).
    pub fn acquire(&self, sector: u32) -> FsResult<CacheHandle> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(slot) = state.slots.get_mut(&sector) {
                    slot.pins += 1;
                    return Ok(CacheHandle { sector });
                }
                if state.slots.len() < CACHE_SLOTS || Self::evict(&mut state, &*self.device)? {
                    let mut data = [0u8; SECTOR_SIZE];
                    self.device.read_sector(sector, &mut data)?;
                    state.slots.insert(
                        sector,
                        Slot {
                            data,
                            accessed: true,
                            dirty: false,
                            pins: 1,
                        },
                    );
                    return Ok(CacheHandle { sector });
                }
            }
            // Every resident entry is pinned. Pins only span a memcpy, so
            // give the holders a chance to release and try again.
            core::hint::spin_loop();
        }
    }

    /// Unpin, recording whether the image was read (`accessed`) or modified
    /// (`dirty`).
    pub fn release(&self, handle: CacheHandle, accessed: bool, dirty: bool) {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(&handle.sector)
            .expect("released sector not resident");
        slot.accessed |= accessed;
        slot.dirty |= dirty;
        assert!(slot.pins > 0, "pin count underflow");
        slot.pins -= 1;
    }

    /// Copy out of a pinned image, starting at `offset` within the sector
    pub fn copy_out(&self, handle: &CacheHandle, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= SECTOR_SIZE);
        let state = self.state.lock();
        let slot = state
            .slots
            .get(&handle.sector)
            .expect("pinned sector not resident");
        out.copy_from_slice(&slot.data[offset..offset + out.len()]);
    }

    /// Copy into a pinned image, starting at `offset` within the sector
    pub fn copy_in(&self, handle: &CacheHandle, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(&handle.sector)
            .expect("pinned sector not resident");
        slot.data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Read a whole sector through the cache
    pub fn read_sector(&self, sector: u32, out: &mut [u8; SECTOR_SIZE]) -> FsResult<()> {
        let handle = self.acquire(sector)?;
        self.copy_out(&handle, 0, out);
        self.release(handle, true, false);
        Ok(())
    }

    /// Write a whole sector through the cache
    pub fn write_sector(&self, sector: u32, src: &[u8; SECTOR_SIZE]) -> FsResult<()> {
        let handle = self.acquire(sector)?;
        self.copy_in(&handle, 0, src);
        self.release(handle, true, true);
        Ok(())
    }

    /// Drop `sector`'s entry without writing it back. Used when the sector's
    /// content is dead: it was released to the free map or is about to be
    /// reinitialized by a direct device write.
    pub fn discard(&self, sector: u32) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get(&sector) {
            assert!(slot.pins == 0, "discard of a pinned sector");
            state.slots.remove(&sector);
        }
    }

    /// Write every dirty image to the device and mark it clean
    pub fn flush(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        for (&sector, slot) in state.slots.iter_mut() {
            if slot.dirty {
                self.device.write_sector(sector, &slot.data)?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    /// Stop the write-behind loop, flush everything, and drop all entries
    pub fn shutdown(&self) -> FsResult<()> {
        self.running.store(false, Ordering::Release);
        self.flush()?;
        self.state.lock().slots.clear();
        Ok(())
    }

    /// Periodic write-behind: flush dirty entries every `interval` ticks
    /// until `shutdown`. Run this on a dedicated thread; it neither evicts
    /// nor touches pins or accessed bits.
    pub fn write_behind(&self, timer: &dyn Timer, interval: u64) {
        while self.running.load(Ordering::Acquire) {
            timer.sleep(interval);
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if self.flush().is_err() {
                crate::log_warn!("write-behind sweep failed, will retry next interval");
            }
        }
    }

    /// Number of resident entries
    pub fn resident_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of dirty entries
    pub fn dirty_count(&self) -> usize {
        self.state.lock().slots.values().filter(|s| s.dirty).count()
    }

    /// One clock sweep. Returns true once a slot has been freed, false if
    /// every entry is pinned (the sweep gives up after two passes).
    fn evict(state: &mut CacheState, device: &dyn BlockDevice) -> FsResult<bool> {
        let mut examined = 0;
        let limit = state.slots.len() * 2;
        while examined < limit {
            let sector = match state
                .slots
                .range(state.hand..)
                .next()
                .map(|(&s, _)| s)
                .or_else(|| state.slots.keys().next().copied())
            {
                Some(s) => s,
                None => return Ok(true),
            };
            state.hand = sector.wrapping_add(1);
            let slot = state.slots.get_mut(&sector).expect("clock candidate");
            if slot.pins > 0 {
                // pinned entries are passed over untouched
            } else if slot.accessed {
                slot.accessed = false;
            } else {
                if slot.dirty {
                    device.write_sector(sector, &slot.data)?;
                }
                state.slots.remove(&sector);
                return Ok(true);
            }
            examined += 1;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::FsError;

    fn rig(sectors: u32) -> (Arc<MemDisk>, BufferCache) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = BufferCache::new(disk.clone());
        (disk, cache)
    }

    #[test]
    fn test_hit_serves_cached_image() {
        let (disk, cache) = rig(128);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[7] = 42;
        disk.write_sector(9, &sector).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        cache.read_sector(9, &mut out).unwrap();
        assert_eq!(out[7], 42);

        // second read must not touch the device again
        let reads_before = disk.stats().0;
        cache.read_sector(9, &mut out).unwrap();
        assert_eq!(disk.stats().0, reads_before);
    }

    #[test]
    fn test_read_after_write_same_sector() {
        let (disk, cache) = rig(128);
        let mut image = [0u8; SECTOR_SIZE];
        image[..5].copy_from_slice(b"hello");
        cache.write_sector(30, &image).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        cache.read_sector(30, &mut out).unwrap();
        assert_eq!(&out[..5], b"hello");

        // the device must not have seen the write yet
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(30, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_population_bounded_with_one_clean_eviction() {
        let (disk, cache) = rig(256);
        let mut out = [0u8; SECTOR_SIZE];
        for sector in 100..100 + CACHE_SLOTS as u32 + 1 {
            cache.read_sector(sector, &mut out).unwrap();
        }
        assert_eq!(cache.resident_count(), CACHE_SLOTS);
        // all entries were clean, so the eviction wrote nothing
        assert_eq!(disk.stats().1, 0);
        // the clock cleared every accessed bit, wrapped, and took the
        // lowest-numbered entry, so touching it again is a miss
        let reads_before = disk.stats().0;
        let handle = cache.acquire(100).unwrap();
        cache.release(handle, false, false);
        assert_eq!(disk.stats().0, reads_before + 1);
    }

    #[test]
    fn test_dirty_victim_written_back() {
        let (disk, cache) = rig(256);
        let mut image = [0u8; SECTOR_SIZE];
        image[0] = 0xEE;
        cache.write_sector(10, &image).unwrap();

        // rotate the whole working set past the dirty entry twice
        let mut out = [0u8; SECTOR_SIZE];
        for sector in 100..100 + 2 * CACHE_SLOTS as u32 {
            cache.read_sector(sector, &mut out).unwrap();
        }

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(10, &mut raw).unwrap();
        assert_eq!(raw[0], 0xEE, "dirty entry must be flushed on eviction");
    }

    #[test]
    fn test_pinned_entry_survives_pressure() {
        let (_disk, cache) = rig(512);
        let handle = cache.acquire(5).unwrap();
        cache.copy_in(&handle, 0, b"pinned");

        let mut out = [0u8; SECTOR_SIZE];
        for sector in 200..200 + 3 * CACHE_SLOTS as u32 {
            cache.read_sector(sector, &mut out).unwrap();
        }
        assert_eq!(cache.resident_count(), CACHE_SLOTS);

        let mut kept = [0u8; 6];
        cache.copy_out(&handle, 0, &mut kept);
        assert_eq!(&kept, b"pinned");
        cache.release(handle, true, true);
    }

    #[test]
    fn test_flush_clears_dirty_bits() {
        let (disk, cache) = rig(64);
        let mut image = [0u8; SECTOR_SIZE];
        image[100] = 7;
        cache.write_sector(3, &image).unwrap();
        assert_eq!(cache.dirty_count(), 1);

        cache.flush().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(3, &mut raw).unwrap();
        assert_eq!(raw[100], 7);

        // a clean flush writes nothing more
        let writes = disk.stats().1;
        cache.flush().unwrap();
        assert_eq!(disk.stats().1, writes);
    }

    #[test]
    fn test_shutdown_flushes_and_empties() {
        let (disk, cache) = rig(64);
        let mut image = [0u8; SECTOR_SIZE];
        image[0] = 1;
        cache.write_sector(20, &image).unwrap();

        cache.shutdown().unwrap();
        assert_eq!(cache.resident_count(), 0);
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(20, &mut raw).unwrap();
        assert_eq!(raw[0], 1);
    }

    #[test]
    fn test_discard_drops_without_writeback() {
        let (disk, cache) = rig(64);
        let mut image = [0xAAu8; SECTOR_SIZE];
        image[0] = 0xAB;
        cache.write_sector(8, &image).unwrap();
        cache.discard(8);
        assert_eq!(cache.resident_count(), 0);

        cache.flush().unwrap();
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(8, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_acquire_propagates_device_error() {
        let (_disk, cache) = rig(4);
        assert_eq!(cache.acquire(1000).err(), Some(FsError::Io));
    }

    #[test]
    fn test_write_behind_flushes_in_background() {
        use std::time::Duration;

        struct MillisTimer;
        impl Timer for MillisTimer {
            fn sleep(&self, _ticks: u64) {
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        let disk = Arc::new(MemDisk::new(64));
        let cache = Arc::new(BufferCache::new(disk.clone()));

        let flusher = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.write_behind(&MillisTimer, WRITE_BEHIND_INTERVAL))
        };

        let mut image = [0u8; SECTOR_SIZE];
        image[..4].copy_from_slice(b"sync");
        cache.write_sector(12, &image).unwrap();

        // wait for a sweep to land the bytes on the device
        let mut raw = [0u8; SECTOR_SIZE];
        for _ in 0..500 {
            disk.read_sector(12, &mut raw).unwrap();
            if &raw[..4] == b"sync" {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(&raw[..4], b"sync", "write-behind never flushed");

        cache.shutdown().unwrap();
        flusher.join().unwrap();
    }
}
