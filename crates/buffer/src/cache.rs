use hashbrown::HashMap;

use common::{BpError, BpResult, Offset};
use storage::PageFile;

use crate::pool::PageBufferPool;

#[derive(Clone, Copy, Debug)]
struct SlotMeta {
    offset: Offset,
    pin_count: u32,
    dirty: bool,
}

impl Default for SlotMeta {
    fn default() -> Self {
        Self {
            offset: 0,
            pin_count: 0,
            dirty: false,
        }
    }
}

/// Offset-indexed LRU cache of page-aligned buffers, sitting directly on
/// top of a [`PageFile`]. Tracks per-page pin counts and dirty bits and
/// never evicts a pinned page.
pub struct PageCache {
    pool: PageBufferPool,
    file: PageFile,
    block_size: usize,
    index: HashMap<Offset, usize>,
    meta: Vec<SlotMeta>,
    /// Boundary slot between the pinned (front) and unpinned (back) run of
    /// the list; `None` when no page is currently unpinned.
    unused_head: Option<usize>,
}

impl PageCache {
    pub fn new(file: PageFile, block_size: usize, capacity: usize) -> Self {
        Self {
            pool: PageBufferPool::new(capacity, block_size),
            file,
            block_size,
            index: HashMap::with_capacity(capacity),
            meta: vec![SlotMeta::default(); capacity + 1],
            unused_head: None,
        }
    }

    /// Fetch (or allocate, if `is_new`) the page at `offset`, pinning it and
    /// returning the slot its bytes live in.
    pub fn get_page(&mut self, offset: Offset, is_new: bool) -> BpResult<usize> {
        if let Some(&slot) = self.index.get(&offset) {
            self.touch_pin(slot);
            self.meta[slot].pin_count += 1;
            log::debug!("cache hit offset={offset:#x} slot={slot}");
            return Ok(slot);
        }

        let slot = self.acquire_slot()?;
        if is_new {
            self.pool.page_mut(slot).fill(0);
            log::debug!("cache miss, allocated new page offset={offset:#x} slot={slot}");
        } else {
            let buf = self.pool.page_mut(slot);
            self.file.read_at(offset, buf)?;
            log::debug!("cache miss, loaded page offset={offset:#x} slot={slot}");
        }

        self.index.insert(offset, slot);
        self.meta[slot] = SlotMeta {
            offset,
            pin_count: 1,
            dirty: is_new,
        };
        Ok(slot)
    }

    /// Decrement the pin count for `offset`; once it reaches zero and the
    /// page is clean, relocate it into the unpinned (evictable) region.
    pub fn unuse_page(&mut self, offset: Offset) -> BpResult<()> {
        let slot = self.slot_of(offset)?;
        let meta = &mut self.meta[slot];
        debug_assert!(meta.pin_count > 0, "unuse_page on a page with no pins");
        meta.pin_count = meta.pin_count.saturating_sub(1);

        if meta.pin_count == 0 && !meta.dirty {
            self.pool.move_before(slot, self.unused_head);
            self.unused_head = Some(slot);
        }
        Ok(())
    }

    /// Mark `offset`'s page dirty. Called by a node handle on release if it
    /// recorded a mutation.
    pub fn mark_dirty(&mut self, offset: Offset) -> BpResult<()> {
        let slot = self.slot_of(offset)?;
        self.meta[slot].dirty = true;
        Ok(())
    }

    /// Write `offset`'s page back to disk and issue a durability barrier,
    /// clearing the dirty bit.
    pub fn sync_page(&mut self, offset: Offset) -> BpResult<()> {
        let slot = self.slot_of(offset)?;
        let bytes = self.pool.page(slot).to_vec();
        self.file.write_at(offset, &bytes)?;
        self.file.barrier()?;
        self.meta[slot].dirty = false;
        log::debug!("synced page offset={offset:#x}");
        Ok(())
    }

    /// Flush every resident dirty page. Used at close.
    pub fn flush_all(&mut self) -> BpResult<()> {
        let dirty: Vec<Offset> = self
            .meta
            .iter()
            .filter(|m| m.dirty)
            .map(|m| m.offset)
            .collect();
        for offset in dirty {
            self.sync_page(offset)?;
        }
        Ok(())
    }

    pub fn page(&self, slot: usize) -> &[u8] {
        self.pool.page(slot)
    }

    pub fn page_mut(&mut self, slot: usize) -> &mut [u8] {
        self.pool.page_mut(slot)
    }

    pub fn pin_count(&self, offset: Offset) -> u32 {
        self.index
            .get(&offset)
            .map(|&slot| self.meta[slot].pin_count)
            .unwrap_or(0)
    }

    pub fn is_cached(&self, offset: Offset) -> bool {
        self.index.contains_key(&offset)
    }

    pub fn resident_len(&self) -> usize {
        self.pool.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn slot_of(&self, offset: Offset) -> BpResult<usize> {
        self.index
            .get(&offset)
            .copied()
            .ok_or_else(|| BpError::Corrupt(format!("page {offset:#x} is not cached")))
    }

    /// Move `slot` to the front of the list (most recently used) and, if it
    /// was marking the unpinned-region boundary, advance that boundary past
    /// it since it is no longer eligible for eviction.
    fn touch_pin(&mut self, slot: usize) {
        if self.unused_head == Some(slot) {
            self.unused_head = self.pool.succ(slot);
        }
        self.pool.move_to_front(slot);
    }

    fn acquire_slot(&mut self) -> BpResult<usize> {
        if let Some(slot) = self.pool.push_front() {
            return Ok(slot);
        }
        self.evict_one()?;
        self.pool.push_front().ok_or(BpError::CacheExhausted)
    }

    fn evict_one(&mut self) -> BpResult<()> {
        self.unused_head.ok_or(BpError::CacheExhausted)?;
        // The unpinned region is the contiguous run from `unused_head` to the
        // list tail, so the tail is always the least-recently-used unpinned page.
        let victim = self
            .pool
            .tail_slot()
            .expect("unused_head implies a non-empty unpinned region");

        let meta = self.meta[victim];
        if meta.dirty {
            // Defensive: in the normal discipline pages are flushed before they
            // go unpinned-and-dirty, but eviction still honors dirty data.
            let bytes = self.pool.page(victim).to_vec();
            self.file.write_at(meta.offset, &bytes)?;
            self.file.barrier()?;
            log::debug!("evicted dirty page offset={:#x} slot={victim}", meta.offset);
        } else {
            log::debug!("evicted clean page offset={:#x} slot={victim}", meta.offset);
        }

        self.index.remove(&meta.offset);
        if self.unused_head == Some(victim) {
            self.unused_head = None;
        }
        self.pool.pop_back();
        Ok(())
    }
}
