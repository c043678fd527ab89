//! Supplemental page table: per-process metadata describing how each
//! virtual page is (or will be) materialized.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::fs::file::File;
use crate::memory::PAGE_SIZE;

/// Round an address down to its page base.
pub fn page_base(vaddr: u64) -> u64 {
    vaddr & !(PAGE_SIZE as u64 - 1)
}

/// Offset of an address within its page.
pub fn page_offset(vaddr: u64) -> u64 {
    vaddr & (PAGE_SIZE as u64 - 1)
}

/// How a page is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Lazily read from a file segment (executable code/data).
    File,
    /// Zero-filled stack page.
    Stack,
    /// Evicted to a swap slot.
    Swapped,
    /// Part of a memory-mapped file.
    Mmap,
}

/// A supplemental page table entry.
#[derive(Debug)]
pub struct Spte {
    pub vaddr: u64,
    pub kind: PageKind,
    pub read_only: bool,
    pub loaded: bool,

    // File and mmap pages.
    pub file: Option<Arc<File>>,
    pub offset: u32,
    pub read_bytes: u32,
    pub zero_bytes: u32,

    // Swapped pages.
    pub swap_slot: Option<usize>,

    // Mmap pages.
    pub map_id: Option<i32>,
}

impl Spte {
    pub fn file_backed(
        vaddr: u64,
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
        read_only: bool,
    ) -> Self {
        assert_eq!(page_offset(vaddr), 0);
        Spte {
            vaddr,
            kind: PageKind::File,
            read_only,
            loaded: false,
            file: Some(file),
            offset,
            read_bytes,
            zero_bytes,
            swap_slot: None,
            map_id: None,
        }
    }

    pub fn mmap_backed(
        vaddr: u64,
        file: Arc<File>,
        map_id: i32,
        offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
    ) -> Self {
        assert_eq!(page_offset(vaddr), 0);
        Spte {
            vaddr,
            kind: PageKind::Mmap,
            read_only: false,
            loaded: false,
            file: Some(file),
            offset,
            read_bytes,
            zero_bytes,
            swap_slot: None,
            map_id: Some(map_id),
        }
    }

    pub fn stack(vaddr: u64) -> Self {
        let vaddr = page_base(vaddr);
        Spte {
            vaddr,
            kind: PageKind::Stack,
            read_only: false,
            loaded: false,
            file: None,
            offset: 0,
            read_bytes: 0,
            zero_bytes: PAGE_SIZE as u32,
            swap_slot: None,
            map_id: None,
        }
    }

    /// The kind this page returns to after swap-in, judged from what
    /// backing references it still carries.
    pub fn kind_after_swap_in(&self) -> PageKind {
        if self.file.is_some() && self.map_id.is_none() {
            PageKind::File
        } else if self.file.is_some() {
            PageKind::Mmap
        } else {
            PageKind::Stack
        }
    }
}

/// Per-process supplemental page table, keyed by page-aligned virtual
/// address. At most one entry per address.
pub struct SuppPageTable {
    entries: BTreeMap<u64, Spte>,
}

impl SuppPageTable {
    pub fn new() -> Self {
        SuppPageTable {
            entries: BTreeMap::new(),
        }
    }

    /// Insert an entry; fails (returning it back) if the address is
    /// already occupied.
    pub fn insert(&mut self, spte: Spte) -> Result<(), Spte> {
        if self.entries.contains_key(&spte.vaddr) {
            return Err(spte);
        }
        self.entries.insert(spte.vaddr, spte);
        Ok(())
    }

    pub fn get(&self, vaddr: u64) -> Option<&Spte> {
        self.entries.get(&page_base(vaddr))
    }

    pub fn get_mut(&mut self, vaddr: u64) -> Option<&mut Spte> {
        self.entries.get_mut(&page_base(vaddr))
    }

    pub fn remove(&mut self, vaddr: u64) -> Option<Spte> {
        self.entries.remove(&page_base(vaddr))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Spte)> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
