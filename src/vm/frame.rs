//! The global frame table: every resident user page has exactly one
//! entry tying the physical frame to its owner's supplemental page
//! table entry (identified by owner thread and virtual address).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::memory::Page;
use crate::threads::Tid;

pub type FrameId = u64;

pub(crate) struct FrameEntry {
    pub id: FrameId,
    pub page: Box<Page>,
    pub owner: Tid,
    pub vaddr: u64,
}

pub(crate) struct FrameTable {
    entries: Vec<FrameEntry>,
    next_id: FrameId,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, page: Box<Page>, owner: Tid, vaddr: u64) -> FrameId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(FrameEntry {
            id,
            page,
            owner,
            vaddr,
        });
        id
    }

    pub fn get(&self, id: FrameId) -> Option<&FrameEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Remove an entry, handing its page back to the caller.
    pub fn remove(&mut self, id: FrameId) -> Option<Box<Page>> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).page)
    }

    pub fn remove_by_mapping(&mut self, owner: Tid, vaddr: u64) -> Option<Box<Page>> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.owner == owner && e.vaddr == vaddr)?;
        Some(self.entries.remove(pos).page)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
