use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::devices::block::{BlockDevice, SectorId, SECTOR_SIZE};

/// Maximum number of cached sectors.
pub const CACHE_SIZE: usize = 64;

struct CacheEntry {
    sector: SectorId,
    payload: [u8; SECTOR_SIZE],
    accessed: bool,
    dirty: bool,
    stamp: u64,
}

struct CacheInner {
    entries: Vec<CacheEntry>,
    /// Monotonic access clock for the LRU stamp.
    clock: u64,
}

impl CacheInner {
    /// Cache hit path: refresh access metadata, OR in the dirty flag.
    fn get(&mut self, sector: SectorId, set_dirty: bool) -> Option<usize> {
        let idx = self.entries.iter().position(|e| e.sector == sector)?;
        self.clock += 1;
        let entry = &mut self.entries[idx];
        entry.accessed = true;
        entry.stamp = self.clock;
        entry.dirty |= set_dirty;
        Some(idx)
    }

    /// Miss path: claim a slot (evicting the victim when full, writing
    /// it back if dirty) and read the sector into it.
    fn fetch(&mut self, device: &dyn BlockDevice, sector: SectorId, set_dirty: bool) -> usize {
        let idx = if self.entries.len() < CACHE_SIZE {
            self.entries.push(CacheEntry {
                sector,
                payload: [0; SECTOR_SIZE],
                accessed: false,
                dirty: false,
                stamp: 0,
            });
            self.entries.len() - 1
        } else {
            let idx = self.victim();
            let entry = &self.entries[idx];
            if entry.dirty {
                device.write_sector(entry.sector, &entry.payload);
            }
            idx
        };
        self.clock += 1;
        let entry = &mut self.entries[idx];
        entry.sector = sector;
        entry.accessed = true;
        entry.dirty = set_dirty;
        entry.stamp = self.clock;
        device.read_sector(sector, &mut entry.payload);
        idx
    }

    /// First entry never re-accessed, else the least recently used.
    fn victim(&self) -> usize {
        let mut best = 0;
        let mut best_stamp = u64::MAX;
        for (idx, entry) in self.entries.iter().enumerate() {
            if !entry.accessed {
                return idx;
            }
            if entry.stamp < best_stamp {
                best = idx;
                best_stamp = entry.stamp;
            }
        }
        best
    }
}

/// Write-back cache of device sectors, bounded at [`CACHE_SIZE`]
/// entries. All mutation happens under one mutex.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        BlockCache {
            device,
            inner: Mutex::new(CacheInner {
                entries: Vec::new(),
                clock: 0,
            }),
        }
    }

    fn with_entry<R>(
        &self,
        sector: SectorId,
        set_dirty: bool,
        f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        let idx = match inner.get(sector, set_dirty) {
            Some(idx) => idx,
            None => inner.fetch(&*self.device, sector, set_dirty),
        };
        f(&mut inner.entries[idx].payload)
    }

    /// Copy part of a sector into `buf`.
    pub fn read_at(&self, sector: SectorId, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        self.with_entry(sector, false, |payload| {
            buf.copy_from_slice(&payload[offset..offset + buf.len()]);
        });
    }

    /// Copy `data` into part of a sector.
    pub fn write_at(&self, sector: SectorId, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= SECTOR_SIZE);
        self.with_entry(sector, true, |payload| {
            payload[offset..offset + data.len()].copy_from_slice(data);
        });
    }

    pub fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]) {
        self.with_entry(sector, false, |payload| buf.copy_from_slice(payload));
    }

    pub fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]) {
        self.with_entry(sector, true, |payload| payload.copy_from_slice(buf));
    }

    /// Fill a sector with zeros (fresh data sectors).
    pub fn zero(&self, sector: SectorId) {
        self.with_entry(sector, true, |payload| payload.fill(0));
    }

    /// Write every dirty entry back to the device (shutdown path).
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            if entry.dirty {
                self.device.write_sector(entry.sector, &entry.payload);
                entry.dirty = false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::MemDisk;

    fn disk_with(n: u32) -> (Arc<MemDisk>, BlockCache) {
        let disk = Arc::new(MemDisk::new(n));
        let cache = BlockCache::new(disk.clone());
        (disk, cache)
    }

    #[test]
    fn write_back_is_deferred_until_flush() {
        let (disk, cache) = disk_with(8);
        cache.write_at(3, 0, &[0xEE; 16]);

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(3, &mut raw);
        assert_eq!(raw[0], 0, "write must not reach the device yet");

        cache.flush();
        disk.read_sector(3, &mut raw);
        assert_eq!(&raw[..16], &[0xEE; 16]);
    }

    #[test]
    fn cache_is_bounded_and_evicts_lru() {
        let (disk, cache) = disk_with(256);
        // Dirty one early sector, then stream enough sectors through
        // to evict it.
        cache.write_at(0, 0, &[0xAB; 4]);
        for s in 1..=CACHE_SIZE as u32 {
            let mut buf = [0u8; 4];
            cache.read_at(s, 0, &mut buf);
        }
        assert_eq!(cache.len(), CACHE_SIZE);

        // The victim write-back must have persisted sector 0.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(0, &mut raw);
        assert_eq!(&raw[..4], &[0xAB; 4]);
    }

    #[test]
    fn read_after_write_hits_cache() {
        let (_disk, cache) = disk_with(8);
        cache.write_at(5, 100, b"payload");
        let mut buf = [0u8; 7];
        cache.read_at(5, 100, &mut buf);
        assert_eq!(&buf, b"payload");
    }
}
