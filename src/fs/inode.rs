//! The indexed inode layer: 12 direct pointers, one indirect block,
//! one doubly-indirect block, 128 pointers per index sector. Maximum
//! file size 12 + 128 + 128·128 = 16524 data sectors.

use alloc::sync::Arc;
use spin::Mutex;

use super::error::{FsError, FsResult};
use super::{Filesys, ROOT_DIR_SECTOR};
use crate::devices::block::{SectorId, SECTOR_SIZE};

/// Identifies an inode sector.
const INODE_MAGIC: u32 = 0x494e_4f44;

pub(crate) const DIRECT_BLOCKS: u32 = 12;
pub(crate) const PTRS_PER_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;
const INDIRECT_SLOT: usize = 12;
const DOUBLE_SLOT: usize = 13;

/// Sectors needed to hold `size` bytes.
pub(crate) fn bytes_to_sectors(size: u32) -> u32 {
    size.div_ceil(SECTOR_SIZE as u32)
}

/// Parsed inode contents plus the in-memory bookkeeping.
#[derive(Debug)]
pub(crate) struct InodeState {
    pub length: u32,
    pub blocks: [SectorId; 14],
    /// Next free direct slot; 12 when all directs are used.
    pub direct: u32,
    /// Next free entry in the indirect block; 128 when full.
    pub indirect: u32,
    /// Next free entry under the doubly-indirect block.
    pub double_indirect: u32,
    pub is_file: bool,
    /// Sector of the containing directory's inode.
    pub parent: SectorId,

    pub open_cnt: u32,
    pub removed: bool,
    pub deny_write_cnt: u32,
}

impl InodeState {
    fn new(is_file: bool) -> Self {
        InodeState {
            length: 0,
            blocks: [0; 14],
            direct: 0,
            indirect: 0,
            double_indirect: 0,
            is_file,
            parent: ROOT_DIR_SECTOR,
            open_cnt: 1,
            removed: false,
            deny_write_cnt: 0,
        }
    }
}

/// An open inode. At most one exists per on-disk sector; the open
/// count governs its lifetime and removed inodes are reaped on the
/// final close.
#[derive(Debug)]
pub struct Inode {
    sector: SectorId,
    pub(crate) state: Mutex<InodeState>,
}

impl Inode {
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn length(&self) -> u32 {
        self.state.lock().length
    }

    pub fn is_file(&self) -> bool {
        self.state.lock().is_file
    }

    pub fn parent_sector(&self) -> SectorId {
        self.state.lock().parent
    }

    pub fn open_cnt(&self) -> u32 {
        self.state.lock().open_cnt
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }
}

/// Serialize the on-disk layout: length, magic, 14 sector pointers,
/// the three allocation cursors, the file flag, the parent sector.
fn encode(state: &InodeState) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    buf[0..4].copy_from_slice(&state.length.to_le_bytes());
    buf[4..8].copy_from_slice(&INODE_MAGIC.to_le_bytes());
    for (i, block) in state.blocks.iter().enumerate() {
        let ofs = 8 + i * 4;
        buf[ofs..ofs + 4].copy_from_slice(&block.to_le_bytes());
    }
    buf[64..68].copy_from_slice(&state.direct.to_le_bytes());
    buf[68..72].copy_from_slice(&state.indirect.to_le_bytes());
    buf[72..76].copy_from_slice(&state.double_indirect.to_le_bytes());
    buf[76] = state.is_file as u8;
    buf[80..84].copy_from_slice(&state.parent.to_le_bytes());
    buf
}

fn decode(buf: &[u8; SECTOR_SIZE]) -> InodeState {
    let word = |ofs: usize| u32::from_le_bytes(buf[ofs..ofs + 4].try_into().unwrap());
    assert_eq!(word(4), INODE_MAGIC, "not an inode sector");
    let mut blocks = [0; 14];
    for (i, block) in blocks.iter_mut().enumerate() {
        *block = word(8 + i * 4);
    }
    InodeState {
        length: word(0),
        blocks,
        direct: word(64),
        indirect: word(68),
        double_indirect: word(72),
        is_file: buf[76] != 0,
        parent: word(80),
        open_cnt: 1,
        removed: false,
        deny_write_cnt: 0,
    }
}

impl Filesys {
    /// Write a fresh inode covering `length` zeroed bytes to `sector`.
    pub fn inode_create(&self, sector: SectorId, length: u32, is_file: bool) -> FsResult<()> {
        let mut state = InodeState::new(is_file);
        if !self.inode_expand(&mut state, length) {
            return Err(FsError::NoSpace);
        }
        state.length = length;
        self.cache.write(sector, &encode(&state));
        Ok(())
    }

    /// Open the inode at `sector`, reusing the in-memory copy if one
    /// is already open.
    pub fn inode_open(&self, sector: SectorId) -> FsResult<Arc<Inode>> {
        let mut open = self.open_inodes.lock();
        if let Some(inode) = open.iter().find(|i| i.sector == sector) {
            inode.state.lock().open_cnt += 1;
            return Ok(inode.clone());
        }
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf);
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(decode(&buf)),
        });
        open.push(inode.clone());
        Ok(inode)
    }

    pub fn inode_reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.state.lock().open_cnt += 1;
        inode.clone()
    }

    /// Drop one reference. The last close writes the inode back, or
    /// frees all of its sectors if it was removed.
    pub fn inode_close(&self, inode: &Arc<Inode>) {
        let mut open = self.open_inodes.lock();
        let mut state = inode.state.lock();
        assert!(state.open_cnt > 0);
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return;
        }
        open.retain(|i| i.sector != inode.sector);
        if state.removed {
            self.inode_free_resources(&state);
            self.free_map.lock().release(inode.sector, 1);
        } else {
            self.cache.write(inode.sector, &encode(&state));
        }
    }

    /// Mark the inode for deletion at the last close.
    pub fn inode_remove(&self, inode: &Arc<Inode>) {
        inode.state.lock().removed = true;
    }

    pub fn inode_deny_write(&self, inode: &Arc<Inode>) {
        let mut state = inode.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    pub fn inode_allow_write(&self, inode: &Arc<Inode>) {
        let mut state = inode.state.lock();
        assert!(state.deny_write_cnt > 0);
        state.deny_write_cnt -= 1;
    }

    /// The data sector holding byte `pos`, or `None` past the length.
    pub(crate) fn byte_to_sector(&self, state: &InodeState, pos: u32) -> Option<SectorId> {
        if pos >= state.length {
            return None;
        }
        let mut idx = pos / SECTOR_SIZE as u32;
        if idx < DIRECT_BLOCKS {
            return Some(state.blocks[idx as usize]);
        }
        idx -= DIRECT_BLOCKS;
        if idx < PTRS_PER_SECTOR {
            let block = self.read_index_block(state.blocks[INDIRECT_SLOT]);
            return Some(block[idx as usize]);
        }
        idx -= PTRS_PER_SECTOR;
        if idx < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
            let ptrs = self.read_index_block(state.blocks[DOUBLE_SLOT]);
            let block = self.read_index_block(ptrs[(idx / PTRS_PER_SECTOR) as usize]);
            return Some(block[(idx % PTRS_PER_SECTOR) as usize]);
        }
        None
    }

    fn read_index_block(&self, sector: SectorId) -> [SectorId; 128] {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf);
        let mut block = [0; 128];
        for (i, entry) in block.iter_mut().enumerate() {
            *entry = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
        block
    }

    fn write_index_block(&self, sector: SectorId, block: &[SectorId; 128]) {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, entry) in block.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }
        self.cache.write(sector, &buf);
    }

    fn alloc_sector(&self) -> Option<SectorId> {
        self.free_map.lock().allocate(1)
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Short reads
    /// happen at end of file.
    pub fn inode_read_at(&self, inode: &Arc<Inode>, buf: &mut [u8], offset: u32) -> usize {
        let state = inode.state.lock();
        let mut read = 0usize;
        let mut offset = offset;
        while read < buf.len() {
            let sector = match self.byte_to_sector(&state, offset) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = (offset % SECTOR_SIZE as u32) as usize;
            let inode_left = (state.length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - read).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            self.cache.read_at(sector, sector_ofs, &mut buf[read..read + chunk]);
            read += chunk;
            offset += chunk as u32;
        }
        read
    }

    /// Write `data` at `offset`, growing the inode as needed. Returns
    /// the number of bytes written; a failed growth yields a short
    /// write with the length reflecting what was persisted.
    pub fn inode_write_at(&self, inode: &Arc<Inode>, data: &[u8], offset: u32) -> usize {
        let mut state = inode.state.lock();
        if state.deny_write_cnt > 0 {
            return 0;
        }
        let end = offset.saturating_add(data.len() as u32);
        if end > state.length && self.inode_expand(&mut state, end) {
            state.length = end;
        }
        let mut written = 0usize;
        let mut offset = offset;
        while written < data.len() {
            let sector = match self.byte_to_sector(&state, offset) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = (offset % SECTOR_SIZE as u32) as usize;
            let inode_left = (state.length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (data.len() - written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            self.cache
                .write_at(sector, sector_ofs, &data[written..written + chunk]);
            written += chunk;
            offset += chunk as u32;
        }
        written
    }

    /// Allocate and zero the sectors needed to reach `new_length`,
    /// direct slots first, then the indirect block, then the doubly
    /// indirect tree. Cursor state and index blocks are persisted as
    /// far as allocation succeeded.
    pub(crate) fn inode_expand(&self, state: &mut InodeState, new_length: u32) -> bool {
        let mut extra = bytes_to_sectors(new_length).saturating_sub(bytes_to_sectors(state.length));
        if extra == 0 {
            return true;
        }

        while state.direct < DIRECT_BLOCKS {
            let sector = match self.alloc_sector() {
                Some(sector) => sector,
                None => return false,
            };
            state.blocks[state.direct as usize] = sector;
            self.cache.zero(sector);
            state.direct += 1;
            extra -= 1;
            if extra == 0 {
                return true;
            }
        }

        if state.indirect < PTRS_PER_SECTOR {
            let mut block = if state.indirect > 0 {
                self.read_index_block(state.blocks[INDIRECT_SLOT])
            } else {
                match self.alloc_sector() {
                    Some(sector) => state.blocks[INDIRECT_SLOT] = sector,
                    None => return false,
                }
                [0; 128]
            };
            while state.indirect < PTRS_PER_SECTOR {
                let sector = match self.alloc_sector() {
                    Some(sector) => sector,
                    None => {
                        self.write_index_block(state.blocks[INDIRECT_SLOT], &block);
                        return false;
                    }
                };
                block[state.indirect as usize] = sector;
                self.cache.zero(sector);
                state.indirect += 1;
                extra -= 1;
                if extra == 0 {
                    break;
                }
            }
            self.write_index_block(state.blocks[INDIRECT_SLOT], &block);
            if extra == 0 {
                return true;
            }
        }

        if state.double_indirect < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
            let mut ptrs = if state.double_indirect > 0 {
                self.read_index_block(state.blocks[DOUBLE_SLOT])
            } else {
                match self.alloc_sector() {
                    Some(sector) => state.blocks[DOUBLE_SLOT] = sector,
                    None => return false,
                }
                [0; 128]
            };
            while state.double_indirect < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
                let block_index = (state.double_indirect / PTRS_PER_SECTOR) as usize;
                let mut block = if state.double_indirect % PTRS_PER_SECTOR == 0 {
                    match self.alloc_sector() {
                        Some(sector) => ptrs[block_index] = sector,
                        None => {
                            self.write_index_block(state.blocks[DOUBLE_SLOT], &ptrs);
                            return false;
                        }
                    }
                    [0; 128]
                } else {
                    self.read_index_block(ptrs[block_index])
                };
                let mut index = (state.double_indirect % PTRS_PER_SECTOR) as usize;
                while index < PTRS_PER_SECTOR as usize {
                    let sector = match self.alloc_sector() {
                        Some(sector) => sector,
                        None => {
                            self.write_index_block(ptrs[block_index], &block);
                            self.write_index_block(state.blocks[DOUBLE_SLOT], &ptrs);
                            return false;
                        }
                    };
                    block[index] = sector;
                    self.cache.zero(sector);
                    state.double_indirect += 1;
                    extra -= 1;
                    index += 1;
                    if extra == 0 {
                        break;
                    }
                }
                self.write_index_block(ptrs[block_index], &block);
                if extra == 0 {
                    break;
                }
            }
            self.write_index_block(state.blocks[DOUBLE_SLOT], &ptrs);
            if extra == 0 {
                return true;
            }
        }
        false
    }

    /// Free every sector the inode references: data sectors, the
    /// index blocks, and their children.
    fn inode_free_resources(&self, state: &InodeState) {
        for i in 0..state.direct as usize {
            self.free_map.lock().release(state.blocks[i], 1);
        }
        if state.indirect > 0 {
            let block = self.read_index_block(state.blocks[INDIRECT_SLOT]);
            let mut free_map = self.free_map.lock();
            for &sector in block.iter().take(state.indirect as usize) {
                free_map.release(sector, 1);
            }
            free_map.release(state.blocks[INDIRECT_SLOT], 1);
        }
        if state.double_indirect > 0 {
            let ptrs = self.read_index_block(state.blocks[DOUBLE_SLOT]);
            let full = state.double_indirect.div_ceil(PTRS_PER_SECTOR) as usize;
            for (bi, &ptr) in ptrs.iter().enumerate().take(full) {
                let block = self.read_index_block(ptr);
                let count = (state.double_indirect - bi as u32 * PTRS_PER_SECTOR)
                    .min(PTRS_PER_SECTOR) as usize;
                let mut free_map = self.free_map.lock();
                for &sector in block.iter().take(count) {
                    free_map.release(sector, 1);
                }
                free_map.release(ptr, 1);
            }
            self.free_map.lock().release(state.blocks[DOUBLE_SLOT], 1);
        }
    }

    /// Record `parent_sector` as the directory containing the inode at
    /// `child_sector`.
    pub(crate) fn inode_set_parent(
        &self,
        parent_sector: SectorId,
        child_sector: SectorId,
    ) -> FsResult<()> {
        let child = self.inode_open(child_sector)?;
        child.state.lock().parent = parent_sector;
        self.inode_close(&child);
        Ok(())
    }

    pub fn open_inode_count(&self) -> usize {
        self.open_inodes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::MemDisk;

    fn fresh_fs(sectors: u32) -> Filesys {
        Filesys::format(Arc::new(MemDisk::new(sectors))).unwrap()
    }

    fn alloc_inode(fs: &Filesys, length: u32) -> SectorId {
        let sector = fs.free_map.lock().allocate(1).unwrap();
        fs.inode_create(sector, length, true).unwrap();
        sector
    }

    #[test]
    fn roundtrip_on_disk_layout() {
        let mut state = InodeState::new(false);
        state.length = 12345;
        state.blocks[0] = 77;
        state.blocks[13] = 99;
        state.direct = 3;
        state.indirect = 17;
        state.double_indirect = 129;
        state.parent = 42;
        let decoded = decode(&encode(&state));
        assert_eq!(decoded.length, 12345);
        assert_eq!(decoded.blocks[0], 77);
        assert_eq!(decoded.blocks[13], 99);
        assert_eq!(decoded.direct, 3);
        assert_eq!(decoded.indirect, 17);
        assert_eq!(decoded.double_indirect, 129);
        assert!(!decoded.is_file);
        assert_eq!(decoded.parent, 42);
    }

    #[test]
    fn open_twice_shares_one_copy() {
        let fs = fresh_fs(128);
        let sector = alloc_inode(&fs, 100);
        let a = fs.inode_open(sector).unwrap();
        let b = fs.inode_open(sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_cnt(), 2);
        fs.inode_close(&b);
        assert_eq!(a.open_cnt(), 1);
        fs.inode_close(&a);
        assert_eq!(fs.open_inode_count(), 0);
    }

    #[test]
    fn write_then_read_back() {
        let fs = fresh_fs(256);
        let sector = alloc_inode(&fs, 0);
        let inode = fs.inode_open(sector).unwrap();

        let data: alloc::vec::Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.inode_write_at(&inode, &data, 0), 1500);
        assert_eq!(inode.length(), 1500);

        let mut back = alloc::vec![0u8; 1500];
        assert_eq!(fs.inode_read_at(&inode, &mut back, 0), 1500);
        assert_eq!(back, data);

        // Reads past the end are short.
        let mut tail = [0u8; 100];
        assert_eq!(fs.inode_read_at(&inode, &mut tail, 1450), 50);
        fs.inode_close(&inode);
    }

    #[test]
    fn growth_reaches_indirect_blocks() {
        // 12 direct sectors cover 6144 bytes; go well past that.
        let fs = fresh_fs(512);
        let sector = alloc_inode(&fs, 0);
        let inode = fs.inode_open(sector).unwrap();

        let size = 40 * SECTOR_SIZE; // 40 sectors: 12 direct + 28 indirect
        let data: alloc::vec::Vec<u8> = (0..size).map(|i| (i % 127) as u8).collect();
        assert_eq!(fs.inode_write_at(&inode, &data, 0), size);

        {
            let state = inode.state.lock();
            assert_eq!(state.direct, 12);
            assert_eq!(state.indirect, 28);
            assert_eq!(state.double_indirect, 0);
            // Every offset maps to a sector, and no two sectors
            // alias.
            let mut seen = alloc::vec::Vec::new();
            for s in 0..40u32 {
                let sector = fs.byte_to_sector(&state, s * SECTOR_SIZE as u32).unwrap();
                assert!(!seen.contains(&sector));
                seen.push(sector);
            }
            assert!(fs.byte_to_sector(&state, size as u32).is_none());
        }

        let mut back = alloc::vec![0u8; size];
        assert_eq!(fs.inode_read_at(&inode, &mut back, 0), size);
        assert_eq!(back, data);
        fs.inode_close(&inode);
    }

    #[test]
    fn growth_reaches_doubly_indirect_blocks() {
        let fs = fresh_fs(1024);
        let sector = alloc_inode(&fs, 0);
        let inode = fs.inode_open(sector).unwrap();

        // 12 + 128 = 140 sectors before the doubly-indirect tree.
        let sectors = 150usize;
        let size = sectors * SECTOR_SIZE;
        let data: alloc::vec::Vec<u8> = (0..size).map(|i| (i / SECTOR_SIZE) as u8).collect();
        assert_eq!(fs.inode_write_at(&inode, &data, 0), size);
        {
            let state = inode.state.lock();
            assert_eq!(state.direct, 12);
            assert_eq!(state.indirect, 128);
            assert_eq!(state.double_indirect, 10);
        }
        // Read a slice spanning the indirect/doubly-indirect seam.
        let mut back = alloc::vec![0u8; 3 * SECTOR_SIZE];
        let seam = 139 * SECTOR_SIZE;
        assert_eq!(fs.inode_read_at(&inode, &mut back, seam as u32), back.len());
        assert_eq!(back, data[seam..seam + back.len()]);
        fs.inode_close(&inode);
    }

    #[test]
    fn sparse_offsets_are_zero_filled() {
        // Writing past EOF zero-fills the gap.
        let fs = fresh_fs(256);
        let sector = alloc_inode(&fs, 0);
        let inode = fs.inode_open(sector).unwrap();
        assert_eq!(fs.inode_write_at(&inode, b"tail", 2000), 4);
        assert_eq!(inode.length(), 2004);
        let mut gap = [0xFFu8; 64];
        assert_eq!(fs.inode_read_at(&inode, &mut gap, 100), 64);
        assert!(gap.iter().all(|&b| b == 0));
        fs.inode_close(&inode);
    }

    #[test]
    fn exhausted_disk_yields_short_write() {
        let fs = fresh_fs(32);
        let sector = alloc_inode(&fs, 0);
        let inode = fs.inode_open(sector).unwrap();
        let big = alloc::vec![7u8; 64 * SECTOR_SIZE];
        let written = fs.inode_write_at(&inode, &big, 0);
        assert!(written < big.len());
        assert_eq!(inode.length() as usize, 0);
        fs.inode_close(&inode);
    }

    #[test]
    fn removed_inode_frees_its_sectors() {
        let fs = fresh_fs(256);
        let before = fs.free_map.lock().used_sectors();
        let sector = alloc_inode(&fs, 20 * SECTOR_SIZE as u32);
        let inode = fs.inode_open(sector).unwrap();
        assert!(fs.free_map.lock().used_sectors() > before);
        fs.inode_remove(&inode);
        fs.inode_close(&inode);
        assert_eq!(fs.free_map.lock().used_sectors(), before);
    }

    #[test]
    fn deny_write_blocks_writes() {
        let fs = fresh_fs(128);
        let sector = alloc_inode(&fs, 10);
        let inode = fs.inode_open(sector).unwrap();
        fs.inode_deny_write(&inode);
        assert_eq!(fs.inode_write_at(&inode, b"x", 0), 0);
        fs.inode_allow_write(&inode);
        assert_eq!(fs.inode_write_at(&inode, b"x", 1), 1);
        fs.inode_close(&inode);
    }
}
