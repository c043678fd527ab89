pub mod palloc;

/// Size of a virtual/physical page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// A page-sized, page-aligned chunk of memory. User frames are boxed
/// pages owned by the frame table.
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    /// Allocate a zero-filled page directly on the heap.
    pub fn new_zeroed() -> alloc::boxed::Box<Page> {
        use alloc::alloc::{alloc_zeroed, handle_alloc_error, Layout};
        let layout = Layout::new::<Page>();
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut Page;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            alloc::boxed::Box::from_raw(ptr)
        }
    }

    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}
