//! Model of a per-process page directory.
//!
//! The paging hardware itself is outside this crate; the core tracks
//! the mapping and the accessed/dirty bits the hardware would keep, so
//! that eviction and mmap write-back have something to consult. A
//! platform port mirrors these entries into real page tables.

use alloc::collections::BTreeMap;
use bitflags::bitflags;

use super::frame::FrameId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
    }
}

/// One page-table entry: the backing frame plus the status bits.
#[derive(Debug, Clone, Copy)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

/// The mapping from page-aligned user virtual addresses to frames for
/// one process.
pub struct PageDir {
    entries: BTreeMap<u64, Pte>,
}

impl PageDir {
    pub fn new() -> Self {
        PageDir {
            entries: BTreeMap::new(),
        }
    }

    /// Map `vaddr` to `frame`. Fails if the page is already mapped.
    pub fn set_page(&mut self, vaddr: u64, frame: FrameId, writable: bool) -> bool {
        if self.entries.contains_key(&vaddr) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(vaddr, Pte { frame, flags });
        true
    }

    pub fn get_page(&self, vaddr: u64) -> Option<FrameId> {
        self.entries.get(&vaddr).map(|pte| pte.frame)
    }

    pub fn clear_page(&mut self, vaddr: u64) {
        self.entries.remove(&vaddr);
    }

    pub fn is_writable(&self, vaddr: u64) -> bool {
        self.entries
            .get(&vaddr)
            .map(|pte| pte.flags.contains(PteFlags::WRITABLE))
            .unwrap_or(false)
    }

    pub fn is_accessed(&self, vaddr: u64) -> bool {
        self.entries
            .get(&vaddr)
            .map(|pte| pte.flags.contains(PteFlags::ACCESSED))
            .unwrap_or(false)
    }

    pub fn set_accessed(&mut self, vaddr: u64, value: bool) {
        if let Some(pte) = self.entries.get_mut(&vaddr) {
            pte.flags.set(PteFlags::ACCESSED, value);
        }
    }

    pub fn is_dirty(&self, vaddr: u64) -> bool {
        self.entries
            .get(&vaddr)
            .map(|pte| pte.flags.contains(PteFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn set_dirty(&mut self, vaddr: u64, value: bool) {
        if let Some(pte) = self.entries.get_mut(&vaddr) {
            pte.flags.set(PteFlags::DIRTY, value);
        }
    }

    /// What the MMU would do on an access: set ACCESSED, and DIRTY on
    /// a write.
    pub fn mark_access(&mut self, vaddr: u64, write: bool) {
        if let Some(pte) = self.entries.get_mut(&vaddr) {
            pte.flags |= PteFlags::ACCESSED;
            if write {
                pte.flags |= PteFlags::DIRTY;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Pte)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_mapping_is_rejected() {
        let mut pd = PageDir::new();
        assert!(pd.set_page(0x1000, 7, true));
        assert!(!pd.set_page(0x1000, 8, true));
        assert_eq!(pd.get_page(0x1000), Some(7));
        pd.clear_page(0x1000);
        assert_eq!(pd.get_page(0x1000), None);
    }

    #[test]
    fn access_marks_bits() {
        let mut pd = PageDir::new();
        pd.set_page(0x2000, 1, true);
        assert!(!pd.is_accessed(0x2000) && !pd.is_dirty(0x2000));
        pd.mark_access(0x2000, false);
        assert!(pd.is_accessed(0x2000) && !pd.is_dirty(0x2000));
        pd.mark_access(0x2000, true);
        assert!(pd.is_dirty(0x2000));
        pd.set_accessed(0x2000, false);
        assert!(!pd.is_accessed(0x2000));
    }
}
