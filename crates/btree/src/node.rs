//! On-disk node layout and the pinned, typed handle the tree engine reads
//! and writes nodes through.

use std::cell::Cell;
use std::rc::Rc;

use buffer::PageCache;
use common::{BpError, BpResult, Key, Offset, Val, INVALID};
use std::cell::RefCell;

const KEY_BYTES: usize = size_of::<Key>();
const OFFSET_BYTES: usize = size_of::<Offset>();
const VALUE_BYTES: usize = size_of::<Val>();

/// Byte layout of the fixed-width header at the front of every page:
/// `self`(8) + `parent`(8) + `prev`(8) + `next`(8) + `node_type`(1) + `children`(2).
const HEADER_BYTES: usize = 8 * 4 + 1 + 2;

const OFF_SELF: usize = 0;
const OFF_PARENT: usize = 8;
const OFF_PREV: usize = 16;
const OFF_NEXT: usize = 24;
const OFF_TYPE: usize = 32;
const OFF_CHILDREN: usize = 33;

const TAG_LEAF: u8 = 0;
const TAG_INTERNAL: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Internal,
}

/// The two capacities derived from the page size: how many children an
/// internal node and a leaf can each hold.
#[derive(Clone, Copy, Debug)]
pub struct Capacities {
    pub m_internal: usize,
    pub m_leaf: usize,
}

impl Capacities {
    pub fn derive(block_size: usize) -> BpResult<Self> {
        if block_size <= HEADER_BYTES {
            return Err(BpError::Config(format!(
                "block_size {block_size} does not leave room for the {HEADER_BYTES}-byte node header"
            )));
        }
        let avail = block_size - HEADER_BYTES;
        let m_internal = avail / (KEY_BYTES + OFFSET_BYTES);
        let m_leaf = avail / (KEY_BYTES + VALUE_BYTES);
        if m_internal < 4 || m_leaf < 4 {
            return Err(BpError::Config(format!(
                "block_size {block_size} is too small to host a usable B+ tree node (m_internal={m_internal}, m_leaf={m_leaf})"
            )));
        }
        Ok(Self { m_internal, m_leaf })
    }

    /// `⌈(M_internal + 1) / 2⌉`: the minimum `children` count an internal
    /// non-root node must maintain.
    pub fn internal_min(&self) -> usize {
        self.m_internal.div_ceil(2)
    }

    /// `⌊(M_leaf + 1) / 2⌋`: the minimum `children` count a leaf non-root
    /// node must maintain. Floor, not ceiling — this is also the leaf split
    /// point, and a ceiling split point can leave the new right leaf one
    /// entry short of this minimum.
    pub fn leaf_min(&self) -> usize {
        (self.m_leaf + 1) / 2
    }

    fn keys_offset(&self) -> usize {
        HEADER_BYTES
    }

    fn internal_subs_offset(&self) -> usize {
        HEADER_BYTES + KEY_BYTES * self.m_internal
    }

    fn leaf_data_offset(&self) -> usize {
        HEADER_BYTES + KEY_BYTES * self.m_leaf
    }
}

/// A pin-counted, move-only, typed view into one cached page, interpreted
/// as a B+ tree node. Header mutations and array writes mark the page
/// dirty; the dirty flag transfers to the cache entry when the handle is
/// dropped, at which point the pin is also released.
pub struct NodeHandle {
    cache: Rc<RefCell<PageCache>>,
    offset: Offset,
    slot: usize,
    caps: Capacities,
    dirty: Cell<bool>,
}

impl NodeHandle {
    pub(crate) fn fetch(
        cache: &Rc<RefCell<PageCache>>,
        offset: Offset,
        is_new: bool,
        caps: Capacities,
    ) -> BpResult<Self> {
        let slot = cache.borrow_mut().get_page(offset, is_new)?;
        Ok(Self {
            cache: Rc::clone(cache),
            offset,
            slot,
            caps,
            dirty: Cell::new(is_new),
        })
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type() == NodeType::Leaf
    }

    fn with_page<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let cache = self.cache.borrow();
        f(cache.page(self.slot))
    }

    fn with_page_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut cache = self.cache.borrow_mut();
        f(cache.page_mut(self.slot))
    }

    fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    // --- header ---

    pub fn parent(&self) -> Offset {
        self.with_page(|p| u64::from_le_bytes(p[OFF_PARENT..OFF_PARENT + 8].try_into().unwrap()))
    }

    pub fn set_parent(&self, parent: Offset) {
        self.with_page_mut(|p| p[OFF_PARENT..OFF_PARENT + 8].copy_from_slice(&parent.to_le_bytes()));
        self.mark_dirty();
    }

    pub fn prev(&self) -> Offset {
        self.with_page(|p| u64::from_le_bytes(p[OFF_PREV..OFF_PREV + 8].try_into().unwrap()))
    }

    pub fn set_prev(&self, prev: Offset) {
        self.with_page_mut(|p| p[OFF_PREV..OFF_PREV + 8].copy_from_slice(&prev.to_le_bytes()));
        self.mark_dirty();
    }

    pub fn next(&self) -> Offset {
        self.with_page(|p| u64::from_le_bytes(p[OFF_NEXT..OFF_NEXT + 8].try_into().unwrap()))
    }

    pub fn set_next(&self, next: Offset) {
        self.with_page_mut(|p| p[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&next.to_le_bytes()));
        self.mark_dirty();
    }

    pub fn node_type(&self) -> NodeType {
        self.with_page(|p| match p[OFF_TYPE] {
            TAG_INTERNAL => NodeType::Internal,
            _ => NodeType::Leaf,
        })
    }

    pub fn children(&self) -> usize {
        self.with_page(|p| u16::from_le_bytes(p[OFF_CHILDREN..OFF_CHILDREN + 2].try_into().unwrap()) as usize)
    }

    pub fn set_children(&self, count: usize) {
        self.with_page_mut(|p| {
            p[OFF_CHILDREN..OFF_CHILDREN + 2].copy_from_slice(&(count as u16).to_le_bytes())
        });
        self.mark_dirty();
    }

    /// Initialize a freshly allocated page's header. Must be called exactly
    /// once, before any array access.
    pub fn init_header(&self, node_type: NodeType) {
        self.with_page_mut(|p| {
            p[OFF_SELF..OFF_SELF + 8].copy_from_slice(&self.offset.to_le_bytes());
            p[OFF_PARENT..OFF_PARENT + 8].copy_from_slice(&INVALID.to_le_bytes());
            p[OFF_PREV..OFF_PREV + 8].copy_from_slice(&INVALID.to_le_bytes());
            p[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&INVALID.to_le_bytes());
            p[OFF_TYPE] = match node_type {
                NodeType::Leaf => TAG_LEAF,
                NodeType::Internal => TAG_INTERNAL,
            };
            p[OFF_CHILDREN..OFF_CHILDREN + 2].copy_from_slice(&0u16.to_le_bytes());
        });
        self.mark_dirty();
    }

    // --- internal node arrays: keys[0..children-1], subs[0..children] ---

    pub fn key(&self, i: usize) -> Key {
        let off = self.caps.keys_offset() + i * KEY_BYTES;
        self.with_page(|p| Key::from_le_bytes(p[off..off + KEY_BYTES].try_into().unwrap()))
    }

    pub fn set_key(&self, i: usize, key: Key) {
        let off = self.caps.keys_offset() + i * KEY_BYTES;
        self.with_page_mut(|p| p[off..off + KEY_BYTES].copy_from_slice(&key.to_le_bytes()));
        self.mark_dirty();
    }

    pub fn sub(&self, i: usize) -> Offset {
        let off = self.caps.internal_subs_offset() + i * OFFSET_BYTES;
        self.with_page(|p| Offset::from_le_bytes(p[off..off + OFFSET_BYTES].try_into().unwrap()))
    }

    pub fn set_sub(&self, i: usize, offset: Offset) {
        let off = self.caps.internal_subs_offset() + i * OFFSET_BYTES;
        self.with_page_mut(|p| p[off..off + OFFSET_BYTES].copy_from_slice(&offset.to_le_bytes()));
        self.mark_dirty();
    }

    // --- leaf arrays: keys[0..children], data[0..children] ---

    pub fn data(&self, i: usize) -> Val {
        let off = self.caps.leaf_data_offset() + i * VALUE_BYTES;
        self.with_page(|p| Val::from_le_bytes(p[off..off + VALUE_BYTES].try_into().unwrap()))
    }

    pub fn set_data(&self, i: usize, value: Val) {
        let off = self.caps.leaf_data_offset() + i * VALUE_BYTES;
        self.with_page_mut(|p| p[off..off + VALUE_BYTES].copy_from_slice(&value.to_le_bytes()));
        self.mark_dirty();
    }

    /// Binary-search the populated key range for `key`. Leaves search
    /// `children` keys; internals search `children - 1`.
    pub fn binary_search_key(&self, key: Key) -> Result<usize, usize> {
        let len = if self.is_leaf() {
            self.children()
        } else {
            self.children().saturating_sub(1)
        };
        let mut lo = 0usize;
        let mut hi = len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(&key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    /// Shift `keys[from..children-1]` and `subs[from..children]` one slot to
    /// the right, making room to insert a key/child pair at `from`.
    pub fn internal_shift_right(&self, from: usize) {
        let children = self.children();
        let keys_base = self.caps.keys_offset();
        let n_keys = children.saturating_sub(1).saturating_sub(from);
        self.with_page_mut(|p| {
            if n_keys > 0 {
                p.copy_within(
                    keys_base + from * KEY_BYTES..keys_base + (from + n_keys) * KEY_BYTES,
                    keys_base + (from + 1) * KEY_BYTES,
                );
            }
        });
        self.mark_dirty();
        self.shift_subs_right(from + 1, children - from - 1);
    }

    fn shift_subs_right(&self, from: usize, count: usize) {
        if count == 0 {
            return;
        }
        let base = self.caps.internal_subs_offset();
        let w = OFFSET_BYTES;
        self.with_page_mut(|p| {
            p.copy_within(base + from * w..base + (from + count) * w, base + (from + 1) * w);
        });
        self.mark_dirty();
    }

    /// Shift `keys[from..children]` and `data[from..children]` one slot to
    /// the right, making room to insert a key/value pair at `from`.
    pub fn leaf_shift_right(&self, from: usize) {
        let children = self.children();
        let count = children - from;
        let keys_base = self.caps.keys_offset();
        let data_base = self.caps.leaf_data_offset();
        self.with_page_mut(|p| {
            if count > 0 {
                p.copy_within(
                    keys_base + from * KEY_BYTES..keys_base + (from + count) * KEY_BYTES,
                    keys_base + (from + 1) * KEY_BYTES,
                );
                p.copy_within(
                    data_base + from * VALUE_BYTES..data_base + (from + count) * VALUE_BYTES,
                    data_base + (from + 1) * VALUE_BYTES,
                );
            }
        });
        self.mark_dirty();
    }

    /// Shift `keys[from+1..children]` and `data[from+1..children]` one slot
    /// to the left, closing the hole left by removing index `from`.
    pub fn leaf_shift_left(&self, from: usize) {
        let children = self.children();
        let count = children - from - 1;
        let keys_base = self.caps.keys_offset();
        let data_base = self.caps.leaf_data_offset();
        self.with_page_mut(|p| {
            if count > 0 {
                p.copy_within(
                    keys_base + (from + 1) * KEY_BYTES..keys_base + (from + 1 + count) * KEY_BYTES,
                    keys_base + from * KEY_BYTES,
                );
                p.copy_within(
                    data_base + (from + 1) * VALUE_BYTES..data_base + (from + 1 + count) * VALUE_BYTES,
                    data_base + from * VALUE_BYTES,
                );
            }
        });
        self.mark_dirty();
    }

    /// Shift every populated key and every populated child pointer one slot
    /// to the right, including `sub(0)`. Used to make room for a new
    /// leftmost key/child pair (borrowing a child from a left sibling).
    pub fn internal_prepend_make_room(&self) {
        let children = self.children();
        let keys_base = self.caps.keys_offset();
        let n_keys = children.saturating_sub(1);
        self.with_page_mut(|p| {
            if n_keys > 0 {
                p.copy_within(
                    keys_base..keys_base + n_keys * KEY_BYTES,
                    keys_base + KEY_BYTES,
                );
            }
        });
        self.mark_dirty();
        let subs_base = self.caps.internal_subs_offset();
        self.with_page_mut(|p| {
            if children > 0 {
                p.copy_within(
                    subs_base..subs_base + children * OFFSET_BYTES,
                    subs_base + OFFSET_BYTES,
                );
            }
        });
        self.mark_dirty();
    }

    /// Shift every key and child pointer after index 0 one slot to the
    /// left, dropping what used to be `key(0)`/`sub(0)`. Used after
    /// donating a leftmost child to a right sibling (borrow-from-right,
    /// from the donor's point of view).
    pub fn internal_pop_front(&self) {
        let children = self.children();
        let keys_base = self.caps.keys_offset();
        let n_keys = children.saturating_sub(1).saturating_sub(1);
        self.with_page_mut(|p| {
            if n_keys > 0 {
                p.copy_within(
                    keys_base + KEY_BYTES..keys_base + (1 + n_keys) * KEY_BYTES,
                    keys_base,
                );
            }
        });
        self.mark_dirty();
        let subs_base = self.caps.internal_subs_offset();
        let n_subs = children.saturating_sub(1);
        self.with_page_mut(|p| {
            if n_subs > 0 {
                p.copy_within(
                    subs_base + OFFSET_BYTES..subs_base + (1 + n_subs) * OFFSET_BYTES,
                    subs_base,
                );
            }
        });
        self.mark_dirty();
    }

    /// Shift `keys[from+1..children-1]` and `subs[from+2..children]` one
    /// slot to the left, closing the hole left by removing separator `from`
    /// and its right child.
    pub fn internal_shift_left(&self, from: usize) {
        let children = self.children();
        let key_count = children.saturating_sub(1).saturating_sub(from + 1);
        let keys_base = self.caps.keys_offset();
        self.with_page_mut(|p| {
            if key_count > 0 {
                p.copy_within(
                    keys_base + (from + 1) * KEY_BYTES..keys_base + (from + 1 + key_count) * KEY_BYTES,
                    keys_base + from * KEY_BYTES,
                );
            }
        });
        self.mark_dirty();
        let sub_count = children.saturating_sub(from + 2);
        let subs_base = self.caps.internal_subs_offset();
        self.with_page_mut(|p| {
            if sub_count > 0 {
                p.copy_within(
                    subs_base + (from + 2) * OFFSET_BYTES..subs_base + (from + 2 + sub_count) * OFFSET_BYTES,
                    subs_base + (from + 1) * OFFSET_BYTES,
                );
            }
        });
        self.mark_dirty();
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        let mut cache = self.cache.borrow_mut();
        if self.dirty.get() {
            if let Err(e) = cache.mark_dirty(self.offset) {
                log::error!("failed to mark page {:#x} dirty on handle drop: {e}", self.offset);
            }
        }
        if let Err(e) = cache.unuse_page(self.offset) {
            log::error!("failed to unpin page {:#x} on handle drop: {e}", self.offset);
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("node_type", &self.node_type())
            .field("children", &self.children())
            .finish()
    }
}
