pub mod frame;
pub mod page;
pub mod pagedir;
pub mod swap;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, Once};

use crate::fs::file::File;
use crate::fs::Filesys;
use crate::memory::palloc::UserPool;
use crate::memory::{Page, PAGE_SIZE};
use crate::threads::Tid;
use frame::{FrameId, FrameTable};
use page::{page_base, PageKind, Spte, SuppPageTable};
use pagedir::PageDir;
use swap::SwapTable;

/// Top of the user virtual address range; the user stack grows down
/// from here.
pub const USER_TOP: u64 = 0xC000_0000;

/// The user stack may grow to at most this size.
pub const MAX_STACK_SIZE: u64 = 1 << 20;

/// A fault below the stack pointer is still stack growth if it lands
/// within this many bytes (x86 PUSHA reaches 32 bytes down).
pub const STACK_SLACK: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No mapping and not eligible for stack growth.
    BadAddress,
    /// An SPT insertion collided with an existing page.
    Collision,
    /// The backing file did not deliver the bytes the SPTE promised.
    IoError,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "bad user address"),
            VmError::Collision => write!(f, "page already mapped"),
            VmError::IoError => write!(f, "backing store I/O failed"),
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;

/// One process's address space: supplemental page table, the page
/// directory model, and its live memory mappings.
pub struct AddrSpace {
    pub spt: SuppPageTable,
    pub pagedir: PageDir,
    mmaps: BTreeMap<i32, Arc<File>>,
}

impl AddrSpace {
    fn new() -> Self {
        AddrSpace {
            spt: SuppPageTable::new(),
            pagedir: PageDir::new(),
            mmaps: BTreeMap::new(),
        }
    }
}

struct VmInner {
    spaces: BTreeMap<Tid, AddrSpace>,
    frames: FrameTable,
    pool: UserPool,
}

/// The virtual-memory context: address spaces keyed by owning thread,
/// the global frame table, the user page pool, and the swap store.
/// One mutex serializes frame-table and cross-process SPT mutations;
/// the swap bitmap has its own.
pub struct Vm {
    inner: Mutex<VmInner>,
    swap: SwapTable,
}

impl Vm {
    pub fn new(pool_pages: usize, swap_device: Arc<dyn crate::devices::block::BlockDevice>) -> Self {
        Vm {
            inner: Mutex::new(VmInner {
                spaces: BTreeMap::new(),
                frames: FrameTable::new(),
                pool: UserPool::new(pool_pages),
            }),
            swap: SwapTable::new(swap_device),
        }
    }

    /// Register an empty address space for `tid`.
    pub fn create_space(&self, tid: Tid) {
        let mut inner = self.inner.lock();
        let old = inner.spaces.insert(tid, AddrSpace::new());
        assert!(old.is_none(), "address space already exists");
    }

    pub fn has_space(&self, tid: Tid) -> bool {
        self.inner.lock().spaces.contains_key(&tid)
    }

    /// Install a lazily-loaded file page (executable segment).
    pub fn install_file_page(
        &self,
        tid: Tid,
        vaddr: u64,
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
        read_only: bool,
    ) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let space = inner.spaces.get_mut(&tid).expect("no address space");
        space
            .spt
            .insert(Spte::file_backed(vaddr, file, offset, read_bytes, zero_bytes, read_only))
            .map_err(|_| VmError::Collision)
    }

    /// Build the initial user stack: one zeroed page just below
    /// [`USER_TOP`], loaded eagerly. Returns the initial stack pointer.
    pub fn setup_stack(&self, fs: &Filesys, tid: Tid) -> VmResult<u64> {
        let vaddr = USER_TOP - PAGE_SIZE as u64;
        {
            let mut inner = self.inner.lock();
            let space = inner.spaces.get_mut(&tid).expect("no address space");
            space
                .spt
                .insert(Spte::stack(vaddr))
                .map_err(|_| VmError::Collision)?;
        }
        self.load_page(fs, tid, vaddr)?;
        Ok(USER_TOP)
    }

    /// Map `file` at `vaddr` under `map_id`, page by page for its full
    /// length. Any collision unwinds the partial mapping.
    pub fn mmap(&self, fs: &Filesys, tid: Tid, map_id: i32, file: File, vaddr: u64) -> VmResult<()> {
        let length = fs.file_length(&file);
        if vaddr == 0 || page_base(vaddr) != vaddr || length == 0 {
            fs.close_file(&file);
            return Err(VmError::BadAddress);
        }
        if vaddr.checked_add(length as u64).map_or(true, |end| end > USER_TOP) {
            fs.close_file(&file);
            return Err(VmError::BadAddress);
        }
        let file = Arc::new(file);
        let mut inner = self.inner.lock();
        let space = inner.spaces.get_mut(&tid).expect("no address space");

        let mut installed = Vec::new();
        let mut remaining = length;
        let mut offset = 0u32;
        let mut page_vaddr = vaddr;
        while remaining > 0 {
            let read_bytes = remaining.min(PAGE_SIZE as u32);
            let zero_bytes = PAGE_SIZE as u32 - read_bytes;
            let spte =
                Spte::mmap_backed(page_vaddr, file.clone(), map_id, offset, read_bytes, zero_bytes);
            if space.spt.insert(spte).is_err() {
                for v in installed {
                    space.spt.remove(v);
                }
                drop(inner);
                fs.close_file(&file);
                return Err(VmError::Collision);
            }
            installed.push(page_vaddr);
            remaining -= read_bytes;
            offset += read_bytes;
            page_vaddr += PAGE_SIZE as u64;
        }
        space.mmaps.insert(map_id, file);
        Ok(())
    }

    /// Tear down mapping `map_id`: write dirty pages back to the file,
    /// free frames and swap slots, destroy the SPTEs, close the
    /// mapping's file handle. Returns false for an unknown id.
    pub fn munmap(&self, fs: &Filesys, tid: Tid, map_id: i32) -> bool {
        let mut guard = self.inner.lock();
        let VmInner {
            spaces,
            frames,
            pool,
        } = &mut *guard;
        let space = match spaces.get_mut(&tid) {
            Some(space) => space,
            None => return false,
        };
        let file = match space.mmaps.remove(&map_id) {
            Some(file) => file,
            None => return false,
        };

        let pages: Vec<u64> = space
            .spt
            .iter()
            .filter(|(_, s)| s.map_id == Some(map_id))
            .map(|(&v, _)| v)
            .collect();
        for vaddr in pages {
            let spte = space.spt.remove(vaddr).unwrap();
            if spte.loaded {
                if let Some(page) = frames.remove_by_mapping(tid, vaddr) {
                    if space.pagedir.is_dirty(vaddr) {
                        fs.file_write_at(&file, &page.0[..spte.read_bytes as usize], spte.offset);
                    }
                    pool.free(page);
                }
                space.pagedir.clear_page(vaddr);
            } else if let Some(slot) = spte.swap_slot {
                // The page went through eviction; the swap slot holds
                // its latest bytes, so they go back to the file.
                let mut page = Page::new_zeroed();
                self.swap.swap_in(slot, &mut page);
                fs.file_write_at(&file, &page.0[..spte.read_bytes as usize], spte.offset);
            }
        }
        drop(guard);
        fs.close_file(&file);
        true
    }

    /// Materialize the page containing `vaddr`. Idempotent when the
    /// page is already resident.
    pub fn load_page(&self, fs: &Filesys, tid: Tid, vaddr: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        self.load_page_inner(&mut inner, fs, tid, page_base(vaddr))
    }

    fn load_page_inner(
        &self,
        inner: &mut VmInner,
        fs: &Filesys,
        tid: Tid,
        vaddr: u64,
    ) -> VmResult<()> {
        let spte = inner
            .spaces
            .get_mut(&tid)
            .expect("no address space")
            .spt
            .get_mut(vaddr)
            .ok_or(VmError::BadAddress)?;
        if spte.loaded {
            return Ok(());
        }
        let kind = spte.kind;
        let file = spte.file.clone();
        let offset = spte.offset;
        let read_bytes = spte.read_bytes as usize;
        let read_only = spte.read_only;
        let swap_slot = spte.swap_slot;

        let zero = kind == PageKind::Stack || read_bytes == 0;
        let frame_id = self.allocate_frame(inner, tid, vaddr, zero);

        let writable = match kind {
            PageKind::File | PageKind::Mmap => {
                let file = file.as_ref().expect("file-backed page without a file");
                if read_bytes > 0 {
                    let got = {
                        let entry = inner.frames.get_mut(frame_id).unwrap();
                        fs.file_read_at(file, &mut entry.page.0[..read_bytes], offset)
                    };
                    if got != read_bytes {
                        let page = inner.frames.remove(frame_id).unwrap();
                        inner.pool.free(page);
                        return Err(VmError::IoError);
                    }
                }
                let entry = inner.frames.get_mut(frame_id).unwrap();
                entry.page.0[read_bytes..].fill(0);
                !read_only
            }
            PageKind::Stack => true,
            PageKind::Swapped => {
                let slot = swap_slot.expect("swapped page without a slot");
                let entry = inner.frames.get_mut(frame_id).unwrap();
                self.swap.swap_in(slot, &mut entry.page);
                true
            }
        };

        let mapped = inner
            .spaces
            .get_mut(&tid)
            .unwrap()
            .pagedir
            .set_page(vaddr, frame_id, writable);
        if !mapped {
            let page = inner.frames.remove(frame_id).unwrap();
            inner.pool.free(page);
            return Err(VmError::Collision);
        }
        let spte = inner
            .spaces
            .get_mut(&tid)
            .unwrap()
            .spt
            .get_mut(vaddr)
            .unwrap();
        if spte.kind == PageKind::Swapped {
            spte.kind = spte.kind_after_swap_in();
            spte.swap_slot = None;
        }
        spte.loaded = true;
        Ok(())
    }

    /// Obtain a frame for (`tid`, `vaddr`): from the pool if it has a
    /// page left, otherwise by evicting a victim into swap.
    fn allocate_frame(&self, inner: &mut VmInner, tid: Tid, vaddr: u64, zero: bool) -> FrameId {
        if let Some(page) = inner.pool.try_alloc() {
            return inner.frames.insert(page, tid, vaddr);
        }

        let victim_id = Self::victim_frame(inner);
        let entry = inner.frames.get_mut(victim_id).unwrap();
        let victim_owner = entry.owner;
        let victim_vaddr = entry.vaddr;
        let slot = self.swap.swap_out(&entry.page);
        if zero {
            entry.page.zero();
        }
        entry.owner = tid;
        entry.vaddr = vaddr;

        let victim_space = inner
            .spaces
            .get_mut(&victim_owner)
            .expect("victim has no address space");
        let victim_spte = victim_space
            .spt
            .get_mut(victim_vaddr)
            .expect("victim frame without an SPTE");
        victim_spte.loaded = false;
        victim_spte.kind = PageKind::Swapped;
        victim_spte.swap_slot = Some(slot);
        victim_space.pagedir.clear_page(victim_vaddr);

        victim_id
    }

    /// Enhanced second chance: prefer (not accessed, not dirty), then
    /// (not accessed, dirty), (accessed, not dirty), (accessed,
    /// dirty). First candidate in the best non-empty class wins.
    fn victim_frame(inner: &VmInner) -> FrameId {
        let mut classes: [Option<FrameId>; 4] = [None; 4];
        let mut last = None;
        for entry in inner.frames.iter() {
            let pagedir = &inner.spaces[&entry.owner].pagedir;
            let accessed = pagedir.is_accessed(entry.vaddr);
            let dirty = pagedir.is_dirty(entry.vaddr);
            let class = (accessed as usize) * 2 + dirty as usize;
            if classes[class].is_none() {
                classes[class] = Some(entry.id);
            }
            last = Some(entry.id);
        }
        classes
            .iter()
            .flatten()
            .next()
            .copied()
            .or(last)
            .expect("no frame to evict")
    }

    /// Page-fault / pointer-validation entry. True when `addr` is (or
    /// now is) backed: an existing page is demand-loaded; an unmapped
    /// address within the growth window gets a fresh stack page.
    pub fn check_user_access(
        &self,
        fs: &Filesys,
        tid: Tid,
        addr: u64,
        esp: u64,
        write: bool,
    ) -> bool {
        if addr >= USER_TOP {
            return false;
        }
        let base = page_base(addr);
        let mut inner = self.inner.lock();
        let mapping = match inner.spaces.get(&tid) {
            Some(space) => space.spt.get(base).map(|spte| spte.read_only),
            None => return false,
        };
        if let Some(read_only) = mapping {
            if write && read_only {
                return false;
            }
            return self.load_page_inner(&mut inner, fs, tid, base).is_ok();
        }
        // Stack growth: at most 32 bytes below the stack pointer, and
        // within the 1 MiB stack region.
        if addr + STACK_SLACK >= esp && addr >= USER_TOP - MAX_STACK_SIZE {
            let inserted = inner
                .spaces
                .get_mut(&tid)
                .unwrap()
                .spt
                .insert(Spte::stack(base))
                .is_ok();
            if !inserted {
                return false;
            }
            return self.load_page_inner(&mut inner, fs, tid, base).is_ok();
        }
        false
    }

    /// Copy user memory at (`tid`, `vaddr`) into `buf`, faulting pages
    /// in as needed. The MMU model marks the pages accessed.
    pub fn read_user(&self, fs: &Filesys, tid: Tid, vaddr: u64, buf: &mut [u8]) -> VmResult<()> {
        self.copy_user(fs, tid, vaddr, buf.len(), false, |inner, frame_id, ofs, len, pos| {
            let entry = inner.frames.get(frame_id).unwrap();
            buf[pos..pos + len].copy_from_slice(&entry.page.0[ofs..ofs + len]);
        })
    }

    /// Copy `data` into user memory at (`tid`, `vaddr`), marking the
    /// pages accessed and dirty.
    pub fn write_user(&self, fs: &Filesys, tid: Tid, vaddr: u64, data: &[u8]) -> VmResult<()> {
        self.copy_user(fs, tid, vaddr, data.len(), true, |inner, frame_id, ofs, len, pos| {
            let entry = inner.frames.get_mut(frame_id).unwrap();
            entry.page.0[ofs..ofs + len].copy_from_slice(&data[pos..pos + len]);
        })
    }

    fn copy_user(
        &self,
        fs: &Filesys,
        tid: Tid,
        vaddr: u64,
        len: usize,
        write: bool,
        mut xfer: impl FnMut(&mut VmInner, FrameId, usize, usize, usize),
    ) -> VmResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut pos = 0usize;
        let mut addr = vaddr;
        while pos < len {
            let base = page_base(addr);
            let ofs = (addr - base) as usize;
            let chunk = (PAGE_SIZE - ofs).min(len - pos);
            self.load_page_inner(inner, fs, tid, base)?;
            let space = inner.spaces.get_mut(&tid).unwrap();
            let frame_id = space.pagedir.get_page(base).ok_or(VmError::BadAddress)?;
            space.pagedir.mark_access(base, write);
            xfer(inner, frame_id, ofs, chunk, pos);
            pos += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Read a NUL-terminated string out of user memory, bounded by
    /// `max`. `None` if any byte is unmapped.
    pub fn read_user_cstr(
        &self,
        fs: &Filesys,
        tid: Tid,
        vaddr: u64,
        max: usize,
    ) -> Option<alloc::string::String> {
        let mut bytes = Vec::new();
        for i in 0..max as u64 {
            let mut b = [0u8];
            if self.read_user(fs, tid, vaddr + i, &mut b).is_err() {
                return None;
            }
            if b[0] == 0 {
                return alloc::string::String::from_utf8(bytes).ok();
            }
            bytes.push(b[0]);
        }
        None
    }

    /// Destroy `tid`'s address space: unmap every mapping (with write
    /// back), free resident frames, release swap slots.
    pub fn destroy_space(&self, fs: &Filesys, tid: Tid) {
        let map_ids: Vec<i32> = {
            let inner = self.inner.lock();
            match inner.spaces.get(&tid) {
                Some(space) => space.mmaps.keys().copied().collect(),
                None => return,
            }
        };
        for map_id in map_ids {
            self.munmap(fs, tid, map_id);
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if let Some(space) = inner.spaces.remove(&tid) {
            for (&vaddr, spte) in space.spt.iter() {
                if spte.loaded {
                    if let Some(page) = inner.frames.remove_by_mapping(tid, vaddr) {
                        inner.pool.free(page);
                    }
                } else if let Some(slot) = spte.swap_slot {
                    self.swap.release(slot);
                }
            }
        }
    }

    /// Frame-table/SPT consistency: every loaded SPTE has exactly one
    /// frame whose PTE points back at it, and vice versa.
    pub fn check_frame_consistency(&self) -> bool {
        let inner = self.inner.lock();
        for entry in inner.frames.iter() {
            let space = match inner.spaces.get(&entry.owner) {
                Some(space) => space,
                None => return false,
            };
            match space.spt.get(entry.vaddr) {
                Some(spte) if spte.loaded => {}
                _ => return false,
            }
            if space.pagedir.get_page(entry.vaddr) != Some(entry.id) {
                return false;
            }
        }
        for (tid, space) in inner.spaces.iter() {
            for (&vaddr, spte) in space.spt.iter() {
                let frame = inner
                    .frames
                    .iter()
                    .filter(|e| e.owner == *tid && e.vaddr == vaddr)
                    .count();
                if spte.loaded && frame != 1 {
                    return false;
                }
                if !spte.loaded && frame != 0 {
                    return false;
                }
            }
        }
        true
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn swap_sectors_in_use(&self) -> usize {
        self.swap.sectors_in_use()
    }

    /// Test/diagnostic access to a process's page-directory bits.
    pub fn set_page_bits(&self, tid: Tid, vaddr: u64, accessed: bool, dirty: bool) {
        let mut inner = self.inner.lock();
        if let Some(space) = inner.spaces.get_mut(&tid) {
            space.pagedir.set_accessed(vaddr, accessed);
            space.pagedir.set_dirty(vaddr, dirty);
        }
    }

    pub fn page_kind(&self, tid: Tid, vaddr: u64) -> Option<PageKind> {
        let inner = self.inner.lock();
        inner
            .spaces
            .get(&tid)
            .and_then(|s| s.spt.get(vaddr))
            .map(|s| s.kind)
    }

    pub fn page_loaded(&self, tid: Tid, vaddr: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .spaces
            .get(&tid)
            .and_then(|s| s.spt.get(vaddr))
            .map(|s| s.loaded)
            .unwrap_or(false)
    }
}

// ──────────────────────────────────────────────────────────────
//  Kernel path: the global VM context
// ──────────────────────────────────────────────────────────────

static VM: Once<Vm> = Once::new();

/// Initialize the global VM context at boot.
pub fn init(pool_pages: usize, swap_device: Arc<dyn crate::devices::block::BlockDevice>) {
    VM.call_once(|| Vm::new(pool_pages, swap_device));
}

/// The global VM context; panics before [`init`].
pub fn global() -> &'static Vm {
    VM.get().expect("vm not initialized")
}
