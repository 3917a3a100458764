use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use common::{BpError, BpResult, Config, Key, Offset, Val, INVALID};
use storage::{validate_alignment, BootRecord, PageFile};

use buffer::PageCache;

use crate::node::{Capacities, NodeHandle, NodeType};

/// Outcome of a successful [`BpTree::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Val),
    NotFound,
}

/// Outcome of a successful [`BpTree::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Outcome of a successful [`BpTree::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// A disk-backed B+ tree mapping 32-bit keys to 64-bit values.
///
/// Owns the boot record (root offset, file-size high-water mark, free
/// list) and a shared handle to the page cache that every [`NodeHandle`]
/// reads and writes through.
pub struct BpTree {
    cache: Rc<RefCell<PageCache>>,
    boot: BootRecord,
    boot_path: PathBuf,
    caps: Capacities,
}

impl BpTree {
    pub fn open(config: Config) -> BpResult<Self> {
        let dir: &Path = config.file_name.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        validate_alignment(config.block_size, dir)?;

        let boot_path = boot_path_for(&config.file_name);
        let boot = if boot_path.exists() {
            let loaded = BootRecord::load(&boot_path)?;
            if loaded.block_size != config.block_size as u64 {
                return Err(BpError::Config(format!(
                    "store at {} was created with block_size {}, but {} was requested",
                    config.file_name.display(),
                    loaded.block_size,
                    config.block_size
                )));
            }
            loaded
        } else {
            let fresh = BootRecord::empty(config.block_size as u64);
            fresh.save(&boot_path)?;
            fresh
        };

        let file = PageFile::open(&config.file_name, config.block_size)?;
        let caps = Capacities::derive(config.block_size)?;
        let cache = Rc::new(RefCell::new(PageCache::new(file, config.block_size, config.cache_size)));

        log::debug!(
            "opened store {} (block_size={}, cache_size={}, m_internal={}, m_leaf={})",
            config.file_name.display(),
            config.block_size,
            config.cache_size,
            caps.m_internal,
            caps.m_leaf
        );

        Ok(Self { cache, boot, boot_path, caps })
    }

    /// Flush every dirty page and persist the boot record.
    pub fn close(&mut self) -> BpResult<()> {
        self.cache.borrow_mut().flush_all()?;
        self.boot.save(&self.boot_path)?;
        Ok(())
    }

    pub fn search(&self, key: Key) -> BpResult<SearchOutcome> {
        if self.boot.is_empty_tree() {
            return Ok(SearchOutcome::NotFound);
        }
        let leaf = self.descend_to_leaf(key)?;
        match leaf.binary_search_key(key) {
            Ok(i) => Ok(SearchOutcome::Found(leaf.data(i))),
            Err(_) => Ok(SearchOutcome::NotFound),
        }
    }

    pub fn insert(&mut self, key: Key, value: Val) -> BpResult<InsertOutcome> {
        if self.boot.is_empty_tree() {
            let leaf = self.new_node(NodeType::Leaf)?;
            leaf.set_key(0, key);
            leaf.set_data(0, value);
            leaf.set_children(1);
            self.boot.root_offset = leaf.offset();
            return Ok(InsertOutcome::Inserted);
        }

        let leaf = self.descend_to_leaf(key)?;
        self.leaf_insert(leaf, key, value)
    }

    pub fn delete(&mut self, key: Key) -> BpResult<DeleteOutcome> {
        if self.boot.is_empty_tree() {
            return Ok(DeleteOutcome::NotFound);
        }
        let leaf = self.descend_to_leaf(key)?;
        match leaf.binary_search_key(key) {
            Err(_) => Ok(DeleteOutcome::NotFound),
            Ok(idx) => {
                self.leaf_remove(leaf, idx)?;
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    // --- lookup ---

    fn descend_to_leaf(&self, key: Key) -> BpResult<NodeHandle> {
        let mut node = self.node(self.boot.root_offset)?;
        while !node.is_leaf() {
            let idx = match node.binary_search_key(key) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            let child_off = node.sub(idx);
            node = self.node(child_off)?;
        }
        Ok(node)
    }

    // --- insertion ---

    fn leaf_insert(&mut self, leaf: NodeHandle, key: Key, value: Val) -> BpResult<InsertOutcome> {
        match leaf.binary_search_key(key) {
            Ok(_) => Ok(InsertOutcome::Duplicate),
            Err(ins) => {
                if leaf.children() < self.caps.m_leaf {
                    leaf.leaf_shift_right(ins);
                    leaf.set_key(ins, key);
                    leaf.set_data(ins, value);
                    leaf.set_children(leaf.children() + 1);
                } else {
                    self.leaf_split_and_insert(leaf, ins, key, value)?;
                }
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    fn leaf_split_and_insert(&mut self, leaf: NodeHandle, ins: usize, key: Key, value: Val) -> BpResult<()> {
        let m_leaf = self.caps.m_leaf;
        let mut keys = Vec::with_capacity(m_leaf + 1);
        let mut vals = Vec::with_capacity(m_leaf + 1);
        for i in 0..ins {
            keys.push(leaf.key(i));
            vals.push(leaf.data(i));
        }
        keys.push(key);
        vals.push(value);
        for i in ins..m_leaf {
            keys.push(leaf.key(i));
            vals.push(leaf.data(i));
        }

        let split = self.caps.leaf_min();
        let old_prev = leaf.prev();
        let old_next = leaf.next();

        let new_node = self.new_node(NodeType::Leaf)?;
        let (left, right) = if ins < split { (new_node, leaf) } else { (leaf, new_node) };

        for (i, &k) in keys[0..split].iter().enumerate() {
            left.set_key(i, k);
        }
        for (i, &v) in vals[0..split].iter().enumerate() {
            left.set_data(i, v);
        }
        left.set_children(split);

        for (i, &k) in keys[split..].iter().enumerate() {
            right.set_key(i, k);
        }
        for (i, &v) in vals[split..].iter().enumerate() {
            right.set_data(i, v);
        }
        right.set_children(keys.len() - split);

        left.set_prev(old_prev);
        left.set_next(right.offset());
        right.set_prev(left.offset());
        right.set_next(old_next);

        if old_prev != INVALID {
            let prev_node = self.node(old_prev)?;
            prev_node.set_next(left.offset());
        }
        if old_next != INVALID {
            let next_node = self.node(old_next)?;
            next_node.set_prev(right.offset());
        }

        let separator = right.key(0);
        self.attach_parent(left, right, separator)
    }

    fn attach_parent(&mut self, left: NodeHandle, right: NodeHandle, separator: Key) -> BpResult<()> {
        let left_parent = left.parent();
        let right_parent = right.parent();

        if left_parent == INVALID && right_parent == INVALID {
            let root = self.new_node(NodeType::Internal)?;
            root.set_key(0, separator);
            root.set_sub(0, left.offset());
            root.set_sub(1, right.offset());
            root.set_children(2);
            left.set_parent(root.offset());
            right.set_parent(root.offset());
            self.boot.root_offset = root.offset();

            let root_off = root.offset();
            let left_off = left.offset();
            let right_off = right.offset();
            drop(root);
            drop(left);
            drop(right);
            self.flush(root_off)?;
            self.flush(left_off)?;
            self.flush(right_off)?;
            Ok(())
        } else {
            let parent_off = if left_parent != INVALID { left_parent } else { right_parent };
            left.set_parent(parent_off);
            right.set_parent(parent_off);
            let left_off = left.offset();
            let right_off = right.offset();
            drop(left);
            drop(right);
            let parent = self.node(parent_off)?;
            self.internal_insert(parent, left_off, right_off, separator)
        }
    }

    fn internal_insert(&mut self, parent: NodeHandle, left_offset: Offset, right_offset: Offset, separator: Key) -> BpResult<()> {
        let ins = match parent.binary_search_key(separator) {
            Ok(_) => unreachable!("a split's separator key cannot already exist in the parent"),
            Err(ins) => ins,
        };

        if parent.children() < self.caps.m_internal {
            parent.internal_shift_right(ins);
            parent.set_key(ins, separator);
            parent.set_sub(ins, left_offset);
            parent.set_sub(ins + 1, right_offset);
            parent.set_children(parent.children() + 1);
            Ok(())
        } else {
            self.internal_split_and_insert(parent, ins, left_offset, right_offset, separator)
        }
    }

    fn internal_split_and_insert(
        &mut self,
        parent: NodeHandle,
        ins: usize,
        left_offset: Offset,
        right_offset: Offset,
        separator: Key,
    ) -> BpResult<()> {
        let m_internal = self.caps.m_internal;
        let mut keys = Vec::with_capacity(m_internal);
        let mut subs = Vec::with_capacity(m_internal + 1);

        for i in 0..ins {
            keys.push(parent.key(i));
        }
        keys.push(separator);
        for i in ins..m_internal - 1 {
            keys.push(parent.key(i));
        }

        for i in 0..ins {
            subs.push(parent.sub(i));
        }
        subs.push(left_offset);
        subs.push(right_offset);
        for i in (ins + 1)..m_internal {
            subs.push(parent.sub(i));
        }

        let split = m_internal / 2;
        let promoted = keys[split];

        let new_node = self.new_node(NodeType::Internal)?;
        let (left, right) = if ins < split { (new_node, parent) } else { (parent, new_node) };

        let left_keys = &keys[0..split];
        let left_subs = &subs[0..split + 1];
        let right_keys = &keys[split + 1..];
        let right_subs = &subs[split + 1..];

        for (i, &k) in left_keys.iter().enumerate() {
            left.set_key(i, k);
        }
        for (i, &s) in left_subs.iter().enumerate() {
            left.set_sub(i, s);
        }
        left.set_children(left_subs.len());

        for (i, &k) in right_keys.iter().enumerate() {
            right.set_key(i, k);
        }
        for (i, &s) in right_subs.iter().enumerate() {
            right.set_sub(i, s);
        }
        right.set_children(right_subs.len());

        for &child_off in left_subs {
            self.reparent(child_off, left.offset())?;
        }
        for &child_off in right_subs {
            self.reparent(child_off, right.offset())?;
        }

        self.attach_parent(left, right, promoted)
    }

    // --- deletion ---

    fn leaf_remove(&mut self, leaf: NodeHandle, idx: usize) -> BpResult<()> {
        let children = leaf.children();
        let is_root = leaf.parent() == INVALID;

        if is_root && children == 1 {
            let off = leaf.offset();
            drop(leaf);
            self.boot.clear_root();
            self.boot.push_free(off);
            return Ok(());
        }

        let min = self.caps.leaf_min();
        if is_root || children > min {
            leaf.leaf_shift_left(idx);
            leaf.set_children(children - 1);
            return Ok(());
        }

        self.leaf_rebalance(leaf, idx)
    }

    fn leaf_rebalance(&mut self, leaf: NodeHandle, idx: usize) -> BpResult<()> {
        leaf.leaf_shift_left(idx);
        leaf.set_children(leaf.children() - 1);

        let parent_off = leaf.parent();
        let parent = self.node(parent_off)?;
        let pos = self.child_index(&parent, leaf.offset())?;

        let left_off = (pos > 0).then(|| parent.sub(pos - 1));
        let right_off = (pos + 1 < parent.children()).then(|| parent.sub(pos + 1));

        let use_left = self.pick_donor(left_off, right_off)?;

        if use_left {
            let sib_off = left_off.expect("use_left implies a left sibling exists");
            let sibling = self.node(sib_off)?;
            if sibling.children() > self.caps.leaf_min() {
                self.borrow_from_left_leaf(&leaf, &sibling, &parent, pos - 1);
                Ok(())
            } else {
                self.merge_leaf(leaf, sibling, true, parent, pos - 1)
            }
        } else {
            let sib_off = right_off.expect("!use_left implies a right sibling exists");
            let sibling = self.node(sib_off)?;
            if sibling.children() > self.caps.leaf_min() {
                self.borrow_from_right_leaf(&leaf, &sibling, &parent, pos);
                Ok(())
            } else {
                self.merge_leaf(leaf, sibling, false, parent, pos)
            }
        }
    }

    fn borrow_from_left_leaf(&self, leaf: &NodeHandle, sibling: &NodeHandle, parent: &NodeHandle, sep_idx: usize) {
        let last = sibling.children() - 1;
        let borrowed_key = sibling.key(last);
        let borrowed_val = sibling.data(last);
        sibling.set_children(last);

        leaf.leaf_shift_right(0);
        leaf.set_key(0, borrowed_key);
        leaf.set_data(0, borrowed_val);
        leaf.set_children(leaf.children() + 1);

        parent.set_key(sep_idx, borrowed_key);
    }

    fn borrow_from_right_leaf(&self, leaf: &NodeHandle, sibling: &NodeHandle, parent: &NodeHandle, sep_idx: usize) {
        let borrowed_key = sibling.key(0);
        let borrowed_val = sibling.data(0);
        let n = leaf.children();
        leaf.set_key(n, borrowed_key);
        leaf.set_data(n, borrowed_val);
        leaf.set_children(n + 1);

        sibling.leaf_shift_left(0);
        sibling.set_children(sibling.children() - 1);

        parent.set_key(sep_idx, sibling.key(0));
    }

    /// Merge `leaf` and `sibling` (one absorbs the other's surviving
    /// entries and the emptied page is freed), splice the leaf list, and
    /// recurse into the parent to drop the now-redundant separator.
    fn merge_leaf(&mut self, leaf: NodeHandle, sibling: NodeHandle, use_left: bool, parent: NodeHandle, sep_idx: usize) -> BpResult<()> {
        let (survivor, victim) = if use_left { (sibling, leaf) } else { (leaf, sibling) };

        let base = survivor.children();
        let vcount = victim.children();
        for i in 0..vcount {
            survivor.set_key(base + i, victim.key(i));
            survivor.set_data(base + i, victim.data(i));
        }
        survivor.set_children(base + vcount);

        let vnext = victim.next();
        survivor.set_next(vnext);
        if vnext != INVALID {
            let next_node = self.node(vnext)?;
            next_node.set_prev(survivor.offset());
            let next_off = next_node.offset();
            drop(next_node);
            self.flush(next_off)?;
        }

        let survivor_off = survivor.offset();
        let victim_off = victim.offset();
        drop(survivor);
        drop(victim);
        self.flush(survivor_off)?;
        self.boot.push_free(victim_off);

        self.internal_remove(parent, sep_idx)
    }

    fn internal_remove(&mut self, node: NodeHandle, idx: usize) -> BpResult<()> {
        let is_root = node.parent() == INVALID;
        let children = node.children();

        if is_root && children == 2 {
            let removed_off = node.sub(idx + 1);
            let surviving = if node.sub(0) == removed_off { node.sub(1) } else { node.sub(0) };

            let surv_node = self.node(surviving)?;
            surv_node.set_parent(INVALID);
            self.boot.root_offset = surviving;
            let surv_off = surv_node.offset();
            drop(surv_node);

            let old_root_off = node.offset();
            drop(node);
            self.boot.push_free(old_root_off);
            self.flush(surv_off)?;
            return Ok(());
        }

        let min = self.caps.internal_min();
        if is_root || children > min {
            node.internal_shift_left(idx);
            node.set_children(children - 1);
            return Ok(());
        }

        self.internal_rebalance(node, idx)
    }

    fn internal_rebalance(&mut self, node: NodeHandle, idx: usize) -> BpResult<()> {
        node.internal_shift_left(idx);
        node.set_children(node.children() - 1);

        let parent_off = node.parent();
        let parent = self.node(parent_off)?;
        let pos = self.child_index(&parent, node.offset())?;

        let left_off = (pos > 0).then(|| parent.sub(pos - 1));
        let right_off = (pos + 1 < parent.children()).then(|| parent.sub(pos + 1));

        let use_left = self.pick_donor(left_off, right_off)?;

        if use_left {
            let sib_off = left_off.expect("use_left implies a left sibling exists");
            let sibling = self.node(sib_off)?;
            if sibling.children() > self.caps.internal_min() {
                self.borrow_from_left_internal(&node, &sibling, &parent, pos - 1)?;
                Ok(())
            } else {
                self.merge_internal(node, sibling, true, parent, pos - 1)
            }
        } else {
            let sib_off = right_off.expect("!use_left implies a right sibling exists");
            let sibling = self.node(sib_off)?;
            if sibling.children() > self.caps.internal_min() {
                self.borrow_from_right_internal(&node, &sibling, &parent, pos)?;
                Ok(())
            } else {
                self.merge_internal(node, sibling, false, parent, pos)
            }
        }
    }

    fn borrow_from_left_internal(&self, node: &NodeHandle, sibling: &NodeHandle, parent: &NodeHandle, sep_idx: usize) -> BpResult<()> {
        let sep_key = parent.key(sep_idx);
        let last_key = sibling.children() - 2;
        let promoted_key = sibling.key(last_key);
        let last_sub = sibling.children() - 1;
        let moved_sub = sibling.sub(last_sub);

        node.internal_prepend_make_room();
        node.set_key(0, sep_key);
        node.set_sub(0, moved_sub);
        node.set_children(node.children() + 1);

        sibling.set_children(sibling.children() - 1);
        parent.set_key(sep_idx, promoted_key);

        self.reparent(moved_sub, node.offset())
    }

    fn borrow_from_right_internal(&self, node: &NodeHandle, sibling: &NodeHandle, parent: &NodeHandle, sep_idx: usize) -> BpResult<()> {
        let sep_key = parent.key(sep_idx);
        let moved_sub = sibling.sub(0);

        let n = node.children();
        node.set_key(n - 1, sep_key);
        node.set_sub(n, moved_sub);
        node.set_children(n + 1);

        let promoted = sibling.key(0);
        sibling.internal_pop_front();
        sibling.set_children(sibling.children() - 1);
        parent.set_key(sep_idx, promoted);

        self.reparent(moved_sub, node.offset())
    }

    fn merge_internal(&mut self, node: NodeHandle, sibling: NodeHandle, use_left: bool, parent: NodeHandle, sep_idx: usize) -> BpResult<()> {
        let (survivor, victim) = if use_left { (sibling, node) } else { (node, sibling) };
        let pivot = parent.key(sep_idx);

        let base_keys = survivor.children() - 1;
        let base_subs = survivor.children();
        survivor.set_key(base_keys, pivot);

        let vkeys = victim.children() - 1;
        for i in 0..vkeys {
            survivor.set_key(base_keys + 1 + i, victim.key(i));
        }
        let vsubs = victim.children();
        for i in 0..vsubs {
            let child = victim.sub(i);
            survivor.set_sub(base_subs + i, child);
            self.reparent(child, survivor.offset())?;
        }
        survivor.set_children(base_subs + vsubs);

        let survivor_off = survivor.offset();
        let victim_off = victim.offset();
        drop(survivor);
        drop(victim);
        self.flush(survivor_off)?;
        self.boot.push_free(victim_off);

        self.internal_remove(parent, sep_idx)
    }

    /// Mirrors the source's sibling-selection rule: prefer whichever
    /// sibling exists if only one does, otherwise the one with more
    /// children, ties broken toward the left.
    fn pick_donor(&self, left_off: Option<Offset>, right_off: Option<Offset>) -> BpResult<bool> {
        match (left_off, right_off) {
            (Some(_), None) => Ok(true),
            (None, Some(_)) => Ok(false),
            (Some(l), Some(r)) => {
                let ls = self.node(l)?;
                let rs = self.node(r)?;
                Ok(ls.children() >= rs.children())
            }
            (None, None) => Err(BpError::Corrupt("underflowing non-root node has no sibling".into())),
        }
    }

    fn child_index(&self, parent: &NodeHandle, child_offset: Offset) -> BpResult<usize> {
        for i in 0..parent.children() {
            if parent.sub(i) == child_offset {
                return Ok(i);
            }
        }
        Err(BpError::Corrupt(format!(
            "child {child_offset:#x} not found among parent {:#x}'s children",
            parent.offset()
        )))
    }

    // --- node access / allocation ---

    pub(crate) fn node(&self, offset: Offset) -> BpResult<NodeHandle> {
        NodeHandle::fetch(&self.cache, offset, false, self.caps)
    }

    fn new_node(&mut self, node_type: NodeType) -> BpResult<NodeHandle> {
        let offset = self.alloc_offset();
        let handle = NodeHandle::fetch(&self.cache, offset, true, self.caps)?;
        handle.init_header(node_type);
        Ok(handle)
    }

    fn alloc_offset(&mut self) -> Offset {
        self.boot.pop_free().unwrap_or_else(|| self.boot.bump_file_size())
    }

    fn reparent(&self, child_offset: Offset, new_parent_offset: Offset) -> BpResult<()> {
        let child = self.node(child_offset)?;
        child.set_parent(new_parent_offset);
        drop(child);
        self.flush(child_offset)
    }

    fn flush(&self, offset: Offset) -> BpResult<()> {
        self.cache.borrow_mut().sync_page(offset)
    }

    pub(crate) fn root_offset(&self) -> Offset {
        self.boot.root_offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.boot.is_empty_tree()
    }

    pub(crate) fn caps(&self) -> Capacities {
        self.caps
    }

    pub(crate) fn free_block_count(&self) -> usize {
        self.boot.free_block_count()
    }
}

fn boot_path_for(file_name: &Path) -> PathBuf {
    let mut os = file_name.as_os_str().to_owned();
    os.push(".boot");
    PathBuf::from(os)
}

impl Drop for BpTree {
    fn drop(&mut self) {
        if let Err(e) = self.cache.borrow_mut().flush_all() {
            log::error!("failed to flush page cache while dropping tree: {e}");
        }
        if let Err(e) = self.boot.save(&self.boot_path) {
            log::error!("failed to persist boot record while dropping tree: {e}");
        }
    }
}
