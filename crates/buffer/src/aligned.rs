use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A single page-aligned allocation big enough for `slot_count` pages of
/// `block_size` bytes each, sliced into fixed-size windows by slot index.
///
/// Mirrors `aligned_alloc`-backed buffers: one allocation, one `Drop`, no
/// per-slot `Vec` churn.
pub struct AlignedPages {
    ptr: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    slot_count: usize,
}

impl AlignedPages {
    pub fn new(slot_count: usize, block_size: usize) -> Self {
        assert!(slot_count > 0 && block_size > 0);
        let layout = Layout::from_size_align(slot_count * block_size, block_size)
            .expect("slot_count * block_size must not overflow and block_size must be a valid alignment");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self {
            ptr,
            layout,
            block_size,
            slot_count,
        }
    }

    pub fn page(&self, slot: usize) -> &[u8] {
        assert!(slot < self.slot_count, "slot {slot} out of bounds");
        // SAFETY: slot is in bounds, buffer is valid for slot_count * block_size bytes,
        // and windows for distinct slots never alias.
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(slot * self.block_size), self.block_size)
        }
    }

    pub fn page_mut(&mut self, slot: usize) -> &mut [u8] {
        assert!(slot < self.slot_count, "slot {slot} out of bounds");
        // SAFETY: see `page`; `&mut self` guarantees exclusive access to the whole
        // allocation, and we only ever hand out one window at a time.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(slot * self.block_size), self.block_size)
        }
    }
}

impl Drop for AlignedPages {
    fn drop(&mut self) {
        // SAFETY: ptr/layout were produced together by `alloc_zeroed` above and
        // never handed out elsewhere.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedPages")
            .field("slot_count", &self.slot_count)
            .field("block_size", &self.block_size)
            .finish()
    }
}
