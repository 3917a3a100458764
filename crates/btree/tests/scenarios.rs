//! End-to-end scenarios driven entirely through the public `btree` API,
//! each against a real `tempfile::tempdir()`-backed store.

use btree::{BpTree, DeleteOutcome, InsertOutcome, SearchOutcome};
use common::Config;
use tempfile::tempdir;

fn open(dir: &tempfile::TempDir, block_size: usize, cache_size: usize) -> BpTree {
    let config = Config::builder()
        .file_name(dir.path().join("tree"))
        .block_size(block_size)
        .cache_size(cache_size)
        .build();
    BpTree::open(config).unwrap()
}

#[test]
fn empty_tree_search() {
    let dir = tempdir().unwrap();
    let tree = open(&dir, 4096, 64);
    assert_eq!(tree.search(7).unwrap(), SearchOutcome::NotFound);
}

#[test]
fn single_insert_lookup() {
    let dir = tempdir().unwrap();
    let mut tree = open(&dir, 4096, 64);
    assert_eq!(tree.insert(42, 1000).unwrap(), InsertOutcome::Inserted);
    assert_eq!(tree.search(42).unwrap(), SearchOutcome::Found(1000));
    assert_eq!(tree.search(41).unwrap(), SearchOutcome::NotFound);
}

#[test]
fn duplicate_rejection() {
    let dir = tempdir().unwrap();
    let mut tree = open(&dir, 4096, 64);
    assert_eq!(tree.insert(5, 100).unwrap(), InsertOutcome::Inserted);
    assert_eq!(tree.insert(5, 200).unwrap(), InsertOutcome::Duplicate);
    assert_eq!(tree.search(5).unwrap(), SearchOutcome::Found(100));
}

#[test]
fn monotonic_bulk_load_and_full_deletion_cycle() {
    let dir = tempdir().unwrap();
    let mut tree = open(&dir, 4096, 2000);

    const N: u32 = 20_000;

    for i in 0..N {
        assert_eq!(tree.insert(i, u64::from(i)).unwrap(), InsertOutcome::Inserted);
    }
    for i in 0..N {
        assert_eq!(tree.search(i).unwrap(), SearchOutcome::Found(u64::from(i)));
    }
    assert_eq!(tree.search(N).unwrap(), SearchOutcome::NotFound);

    for i in 0..N {
        assert_eq!(tree.delete(i).unwrap(), DeleteOutcome::Deleted);
    }
    for i in 0..N {
        assert_eq!(tree.search(i).unwrap(), SearchOutcome::NotFound);
    }
}

#[test]
fn persistence_across_close_and_reopen() {
    let dir = tempdir().unwrap();
    const N: u32 = 5_000;

    {
        let mut tree = open(&dir, 4096, 512);
        for i in 0..N {
            tree.insert(i, u64::from(i) * 2).unwrap();
        }
        tree.close().unwrap();
    }

    let tree = open(&dir, 4096, 512);
    for i in 0..N {
        assert_eq!(tree.search(i).unwrap(), SearchOutcome::Found(u64::from(i) * 2));
    }
}

#[test]
fn reopen_after_persistence_allocates_no_additional_pages() {
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("tree");
    const N: u32 = 2_000;

    {
        let mut tree = open(&dir, 4096, 512);
        for i in 0..N {
            tree.insert(i, u64::from(i)).unwrap();
        }
        tree.close().unwrap();
    }
    let size_after_close = std::fs::metadata(&data_path).unwrap().len();

    let tree = open(&dir, 4096, 512);
    for i in 0..N {
        let _ = tree.search(i).unwrap();
    }
    drop(tree);
    let size_after_reopen = std::fs::metadata(&data_path).unwrap().len();

    assert_eq!(size_after_close, size_after_reopen);
}

#[test]
fn reverse_order_insert_then_random_deletes() {
    let dir = tempdir().unwrap();
    let mut tree = open(&dir, 512, 128);

    for i in (0..3000u32).rev() {
        tree.insert(i, u64::from(i) + 1).unwrap();
    }

    // Delete every fifth key, then every third of what remains.
    for i in (0..3000u32).step_by(5) {
        assert_eq!(tree.delete(i).unwrap(), DeleteOutcome::Deleted);
    }
    for i in (0..3000u32).step_by(3) {
        let outcome = tree.delete(i).unwrap();
        assert!(matches!(outcome, DeleteOutcome::Deleted | DeleteOutcome::NotFound));
    }

    for i in 0..3000u32 {
        let deleted = i % 5 == 0 || i % 3 == 0;
        let expect = if deleted { SearchOutcome::NotFound } else { SearchOutcome::Found(u64::from(i) + 1) };
        assert_eq!(tree.search(i).unwrap(), expect);
    }
}

#[test]
fn deleting_a_missing_key_reports_not_found() {
    let dir = tempdir().unwrap();
    let mut tree = open(&dir, 4096, 64);
    tree.insert(1, 1).unwrap();
    assert_eq!(tree.delete(2).unwrap(), DeleteOutcome::NotFound);
}

#[test]
fn visualize_on_empty_and_populated_trees_does_not_panic() {
    let dir = tempdir().unwrap();
    let mut tree = open(&dir, 256, 64);
    assert_eq!(tree.visualize().unwrap(), vec!["(empty tree)".to_string()]);

    for i in 0..200u32 {
        tree.insert(i, u64::from(i)).unwrap();
    }
    let lines = tree.visualize().unwrap();
    assert!(!lines.is_empty());
    assert!(lines.iter().any(|l| l.contains("leaf@")));
}
