use std::sync::Arc;
use std::thread;

use anyhow::Result;

use kestreldb::common::types::Rid;
use kestreldb::index::btree::BPlusTree;

mod common;
use common::create_test_buffer_pool;

fn collect_keys(tree: &BPlusTree<i64, Rid>) -> Result<Vec<i64>> {
    let mut keys = Vec::new();
    for item in tree.iter()? {
        let (key, _) = item?;
        keys.push(key);
    }
    Ok(keys)
}

#[test]
fn test_insert_and_lookup() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("t", buffer_pool, 3, 5)?;

    assert!(tree.is_empty());
    for key in [7i64, 3, 9, 1, 5] {
        assert!(tree.insert(&key, &Rid::new(1, key as u32))?);
    }
    assert!(!tree.is_empty());

    for key in [7i64, 3, 9, 1, 5] {
        assert_eq!(tree.get_value(&key)?, Some(Rid::new(1, key as u32)));
    }
    assert_eq!(tree.get_value(&4)?, None);
    Ok(())
}

#[test]
fn test_duplicate_insert_rejected() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("t", buffer_pool, 3, 5)?;

    assert!(tree.insert(&42, &Rid::new(1, 1))?);
    assert!(!tree.insert(&42, &Rid::new(1, 2))?);
    assert_eq!(tree.get_value(&42)?, Some(Rid::new(1, 1)));
    Ok(())
}

#[test]
fn test_splits_keep_order() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(128)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("t", buffer_pool, 3, 3)?;

    // Ascending, descending and shuffled segments force splits at both
    // levels of the tree
    let mut keys: Vec<i64> = (0..100).collect();
    keys.extend((100..200).rev());
    keys.extend([250, 220, 210, 270, 205, 290, 260, 240, 230, 280]);
    for key in &keys {
        assert!(tree.insert(key, &Rid::new(0, *key as u32))?);
    }

    let collected = collect_keys(&tree)?;
    let mut expected = keys.clone();
    expected.sort_unstable();
    assert_eq!(collected, expected);

    for key in &keys {
        assert_eq!(tree.get_value(key)?, Some(Rid::new(0, *key as u32)));
    }
    Ok(())
}

#[test]
fn test_remove_with_coalesce_and_redistribute() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(128)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("t", buffer_pool, 4, 4)?;

    let keys: Vec<i64> = (0..200).collect();
    for key in &keys {
        tree.insert(key, &Rid::new(0, *key as u32))?;
    }

    // Remove every other key, then the rest, shrinking the tree back to
    // nothing through merges and root demotions
    for key in keys.iter().step_by(2) {
        tree.remove(key)?;
    }
    let collected = collect_keys(&tree)?;
    let expected: Vec<i64> = keys.iter().copied().filter(|k| k % 2 == 1).collect();
    assert_eq!(collected, expected);

    for key in keys.iter().filter(|k| *k % 2 == 1) {
        tree.remove(key)?;
    }
    assert!(tree.is_empty());
    assert_eq!(collect_keys(&tree)?, Vec::<i64>::new());

    // Removing from the emptied tree stays a no-op
    tree.remove(&5)?;
    Ok(())
}

#[test]
fn test_remove_missing_key_is_silent() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("t", buffer_pool, 3, 5)?;

    tree.insert(&1, &Rid::new(0, 1))?;
    tree.remove(&99)?;
    assert_eq!(tree.get_value(&1)?, Some(Rid::new(0, 1)));
    Ok(())
}

#[test]
fn test_iter_from_seeks_first_geq() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    let tree: BPlusTree<i64, Rid> = BPlusTree::new("t", buffer_pool, 3, 5)?;

    for key in (0..50i64).map(|k| k * 2) {
        tree.insert(&key, &Rid::new(0, key as u32))?;
    }

    // Probe between stored keys: the scan starts at the next larger key
    let mut iter = tree.iter_from(&13)?;
    let (first, _) = iter.next().unwrap()?;
    assert_eq!(first, 14);

    // Probe on a stored key: the scan starts exactly there
    let rest: Result<Vec<(i64, Rid)>, _> = tree.iter_from(&90)?.collect();
    let rest_keys: Vec<i64> = rest?.into_iter().map(|(k, _)| k).collect();
    assert_eq!(rest_keys, vec![90, 92, 94, 96, 98]);

    // Probe past the maximum: empty scan
    assert_eq!(tree.iter_from(&1000)?.count(), 0);
    Ok(())
}

#[test]
fn test_reopen_from_header_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(64)?;
    {
        let tree: BPlusTree<i64, Rid> = BPlusTree::new("orders_pk", Arc::clone(&buffer_pool), 3, 5)?;
        for key in 0..50i64 {
            tree.insert(&key, &Rid::new(0, key as u32))?;
        }
    }

    // A second handle finds the root through the block-0 registry
    let reopened: BPlusTree<i64, Rid> = BPlusTree::open("orders_pk", Arc::clone(&buffer_pool), 3, 5)?;
    for key in 0..50i64 {
        assert_eq!(reopened.get_value(&key)?, Some(Rid::new(0, key as u32)));
    }

    assert!(BPlusTree::<i64, Rid>::open("missing", buffer_pool, 3, 5).is_err());
    Ok(())
}

#[test]
fn test_concurrent_disjoint_inserts() -> Result<()> {
    // Four threads insert 1..=1000 partitioned by key mod 4; afterwards an
    // in-order traversal yields exactly 1..=1000
    let (buffer_pool, _temp_file) = create_test_buffer_pool(256)?;
    let tree: Arc<BPlusTree<i64, Rid>> = Arc::new(BPlusTree::new("t", buffer_pool, 3, 5)?);

    let mut handles = Vec::new();
    for t in 0..4i64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for key in (1..=1000i64).filter(|k| k % 4 == t) {
                assert!(tree.insert(&key, &Rid::new(0, key as u32)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let collected = collect_keys(&tree)?;
    let expected: Vec<i64> = (1..=1000).collect();
    assert_eq!(collected, expected);

    for key in 1..=1000i64 {
        assert_eq!(tree.get_value(&key)?, Some(Rid::new(0, key as u32)));
    }
    Ok(())
}

#[test]
fn test_concurrent_insert_then_remove_leaves_empty() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(256)?;
    let tree: Arc<BPlusTree<i64, Rid>> = Arc::new(BPlusTree::new("t", buffer_pool, 3, 5)?);

    let mut handles = Vec::new();
    for t in 0..4i64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let keys: Vec<i64> = (1..=400i64).filter(|k| k % 4 == t).collect();
            for key in &keys {
                assert!(tree.insert(key, &Rid::new(0, *key as u32)).unwrap());
            }
            for key in &keys {
                tree.remove(key).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(collect_keys(&tree)?, Vec::<i64>::new());
    assert!(tree.is_empty());
    Ok(())
}

#[test]
fn test_concurrent_readers_and_writers() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(256)?;
    let tree: Arc<BPlusTree<i64, Rid>> = Arc::new(BPlusTree::new("t", buffer_pool, 4, 4)?);

    for key in 0..200i64 {
        tree.insert(&key, &Rid::new(0, key as u32))?;
    }

    let mut handles = Vec::new();
    // Two writers churn a disjoint upper key range
    for t in 0..2i64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for round in 0..5 {
                for key in (1000..1200i64).filter(|k| k % 2 == t) {
                    tree.insert(&(key + round * 1000), &Rid::new(0, key as u32)).unwrap();
                }
                for key in (1000..1200i64).filter(|k| k % 2 == t) {
                    tree.remove(&(key + round * 1000)).unwrap();
                }
            }
        }));
    }
    // Two readers verify the stable lower range throughout
    for _ in 0..2 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for _ in 0..20 {
                for key in 0..200i64 {
                    assert_eq!(tree.get_value(&key).unwrap(), Some(Rid::new(0, key as u32)));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    Ok(())
}
