//! Whitebox engine tests: walk the on-disk structure directly to assert
//! the invariants from the design (strict key order, minimum fill,
//! separator correctness, leaf-list ordering) after every mutation, on
//! top of the black-box `tests/` scenarios that only use the public API.

use common::{Config, Key};
use tempfile::tempdir;

use crate::engine::{BpTree, InsertOutcome, SearchOutcome};
use crate::node::NodeHandle;

fn small_store(block_size: usize, cache_size: usize) -> (tempfile::TempDir, BpTree) {
    let dir = tempdir().unwrap();
    let config = Config::builder()
        .file_name(dir.path().join("tree"))
        .block_size(block_size)
        .cache_size(cache_size)
        .build();
    let tree = BpTree::open(config).unwrap();
    (dir, tree)
}

/// Walk every reachable node and collect the keys seen in leaves, in
/// on-disk sibling-list order, while checking invariants 1-3 and 5 from
/// the design as it goes.
fn assert_invariants(tree: &BpTree) {
    if tree.is_empty() {
        return;
    }

    let caps = tree.caps();
    let mut reachable = std::collections::HashSet::new();
    let mut stack = vec![tree.root_offset()];

    while let Some(offset) = stack.pop() {
        assert!(reachable.insert(offset), "offset {offset:#x} reached twice");
        let node = tree.node(offset).unwrap();
        let is_root = node.parent() == common::INVALID;
        let children = node.children();

        if node.is_leaf() {
            if !is_root {
                assert!(
                    children >= caps.leaf_min(),
                    "leaf {offset:#x} underflowed: {children} < {}",
                    caps.leaf_min()
                );
            }
            assert_strictly_ascending(&node, children, true);
        } else {
            if !is_root {
                assert!(
                    children >= caps.internal_min(),
                    "internal {offset:#x} underflowed: {children} < {}",
                    caps.internal_min()
                );
            }
            assert_strictly_ascending(&node, children.saturating_sub(1), false);

            for i in 0..children {
                let child_off = node.sub(i);
                let child = tree.node(child_off).unwrap();
                assert_eq!(child.parent(), offset, "child {child_off:#x}'s parent pointer is stale");
                if i > 0 {
                    let sep = node.key(i - 1);
                    let min_key = min_key_in_subtree(tree, child_off);
                    assert_eq!(
                        min_key, sep,
                        "separator {sep} does not equal the smallest key under child {i}"
                    );
                }
                stack.push(child_off);
            }
        }
    }

    assert_leaf_list_is_sorted_and_complete(tree);
}

fn assert_strictly_ascending(node: &NodeHandle, len: usize, _is_leaf: bool) {
    for i in 1..len {
        assert!(node.key(i - 1) < node.key(i), "keys not strictly ascending in node {:#x}", node.offset());
    }
}

fn min_key_in_subtree(tree: &BpTree, mut offset: common::Offset) -> Key {
    loop {
        let node = tree.node(offset).unwrap();
        if node.is_leaf() {
            return node.key(0);
        }
        offset = node.sub(0);
    }
}

fn assert_leaf_list_is_sorted_and_complete(tree: &BpTree) {
    let mut offset = leftmost_leaf(tree);
    let mut prev_key: Option<Key> = None;
    let mut count = 0usize;

    while offset != common::INVALID {
        let node = tree.node(offset).unwrap();
        assert!(node.is_leaf());
        for i in 0..node.children() {
            let k = node.key(i);
            if let Some(p) = prev_key {
                assert!(p < k, "leaf list out of order: {p} before {k}");
            }
            prev_key = Some(k);
            count += 1;
        }
        offset = node.next();
    }
    assert!(count > 0, "leaf list visited no keys on a non-empty tree");
}

fn leftmost_leaf(tree: &BpTree) -> common::Offset {
    let mut offset = tree.root_offset();
    loop {
        let node = tree.node(offset).unwrap();
        if node.is_leaf() {
            return offset;
        }
        offset = node.sub(0);
    }
}

#[test]
fn empty_tree_search_misses() {
    let (_dir, tree) = small_store(4096, 16);
    assert_eq!(tree.search(7).unwrap(), SearchOutcome::NotFound);
}

#[test]
fn single_insert_then_lookup() {
    let (_dir, mut tree) = small_store(4096, 16);
    assert_eq!(tree.insert(42, 1000).unwrap(), InsertOutcome::Inserted);
    assert_eq!(tree.search(42).unwrap(), SearchOutcome::Found(1000));
    assert_eq!(tree.search(41).unwrap(), SearchOutcome::NotFound);
    assert_invariants(&tree);
}

#[test]
fn duplicate_insert_is_rejected_and_leaves_tree_unchanged() {
    let (_dir, mut tree) = small_store(4096, 16);
    assert_eq!(tree.insert(5, 100).unwrap(), InsertOutcome::Inserted);
    assert_eq!(tree.insert(5, 200).unwrap(), InsertOutcome::Duplicate);
    assert_eq!(tree.search(5).unwrap(), SearchOutcome::Found(100));
}

#[test]
fn small_block_size_forces_splits_and_keeps_invariants() {
    // A tiny page forces M_leaf/M_internal down to single digits so a few
    // hundred inserts walk every split/merge code path.
    let (_dir, mut tree) = small_store(128, 32);

    for k in 0..500u32 {
        tree.insert(k, u64::from(k) * 10).unwrap();
        if k % 17 == 0 {
            assert_invariants(&tree);
        }
    }
    assert_invariants(&tree);

    for k in 0..500u32 {
        assert_eq!(tree.search(k).unwrap(), SearchOutcome::Found(u64::from(k) * 10));
    }
    assert_eq!(tree.search(500).unwrap(), SearchOutcome::NotFound);
}

#[test]
fn even_m_leaf_block_size_keeps_min_fill_through_splits_and_merges() {
    // block 256 gives an even M_leaf (18), unlike 128/512 (both odd) —
    // exercises the floor-vs-ceil split point distinction in `leaf_min`.
    let (_dir, mut tree) = small_store(256, 32);

    for k in 0..600u32 {
        tree.insert(k, u64::from(k)).unwrap();
        if k % 23 == 0 {
            assert_invariants(&tree);
        }
    }
    assert_invariants(&tree);

    for k in (0..600u32).step_by(2) {
        tree.delete(k).unwrap();
        if k % 23 == 0 {
            assert_invariants(&tree);
        }
    }
    assert_invariants(&tree);

    for k in 0..600u32 {
        let expect = if k % 2 == 0 { SearchOutcome::NotFound } else { SearchOutcome::Found(u64::from(k)) };
        assert_eq!(tree.search(k).unwrap(), expect);
    }
}

#[test]
fn deleting_every_key_empties_the_tree_and_frees_every_page() {
    let (_dir, mut tree) = small_store(128, 32);

    for k in 0..300u32 {
        tree.insert(k, u64::from(k)).unwrap();
    }
    assert_invariants(&tree);

    for k in 0..300u32 {
        assert_eq!(tree.delete(k).unwrap(), crate::engine::DeleteOutcome::Deleted);
    }

    for k in 0..300u32 {
        assert_eq!(tree.search(k).unwrap(), SearchOutcome::NotFound);
    }
    assert!(tree.is_empty());
    assert!(tree.free_block_count() > 0, "every released page should land on the free list");
}

#[test]
fn descending_inserts_and_interleaved_deletes_keep_invariants() {
    let (_dir, mut tree) = small_store(512, 24);

    for k in (0..200u32).rev() {
        tree.insert(k, u64::from(k)).unwrap();
    }
    assert_invariants(&tree);

    for k in (0..200u32).step_by(3) {
        assert_eq!(tree.delete(k).unwrap(), crate::engine::DeleteOutcome::Deleted);
    }
    assert_invariants(&tree);

    for k in 0..200u32 {
        let expect = if k % 3 == 0 { SearchOutcome::NotFound } else { SearchOutcome::Found(u64::from(k)) };
        assert_eq!(tree.search(k).unwrap(), expect);
    }
}

#[test]
fn close_and_reopen_preserves_every_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree");

    {
        let config = Config::builder().file_name(path.clone()).block_size(128).cache_size(32).build();
        let mut tree = BpTree::open(config).unwrap();
        for k in 0..300u32 {
            tree.insert(k, u64::from(k) * 3).unwrap();
        }
        tree.close().unwrap();
    }

    let config = Config::builder().file_name(path).block_size(128).cache_size(32).build();
    let tree = BpTree::open(config).unwrap();
    for k in 0..300u32 {
        assert_eq!(tree.search(k).unwrap(), SearchOutcome::Found(u64::from(k) * 3));
    }
}

#[test]
fn reopening_with_a_mismatched_block_size_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree");

    let config = Config::builder().file_name(path.clone()).block_size(4096).cache_size(16).build();
    BpTree::open(config).unwrap().close().unwrap();

    let mismatched = Config::builder().file_name(path).block_size(8192).cache_size(16).build();
    assert!(BpTree::open(mismatched).is_err());
}
