use std::sync::Arc;
use std::thread;

use kestreldb::storage::buffer::ExtendibleHashTable;

#[test]
fn test_directory_growth_shape() {
    // Bucket capacity 2, keys 1..=9: three directory doublings, five buckets
    let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);
    for key in 1..=9u32 {
        table.insert(key, key * 100);
    }

    assert_eq!(table.global_depth(), 3);
    assert_eq!(table.num_buckets(), 5);
    assert_eq!(table.local_depth(0), 2);
    assert_eq!(table.local_depth(1), 3);
    assert_eq!(table.local_depth(2), 2);
    assert_eq!(table.local_depth(3), 2);

    for key in 1..=9u32 {
        assert_eq!(table.find(&key), Some(key * 100));
    }
}

#[test]
fn test_depth_invariants_hold_under_load() {
    let capacity = 4;
    let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(capacity);
    for i in 0..512u32 {
        table.insert(i.wrapping_mul(2654435761), i);
    }

    let global = table.global_depth();
    let mut max_local = 0;
    for slot in 0..(1usize << global) {
        let local = table.local_depth(slot);
        assert!(local <= global, "local depth must never exceed global");
        max_local = max_local.max(local);
    }
    assert_eq!(
        max_local, global,
        "the directory only doubles when a bucket catches up with it"
    );
}

#[test]
fn test_remove_then_find_misses() {
    let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(3);
    for key in 0..32u32 {
        table.insert(key, key);
    }

    for key in (0..32u32).step_by(2) {
        assert!(table.remove(&key));
    }
    for key in 0..32u32 {
        if key % 2 == 0 {
            assert_eq!(table.find(&key), None);
            assert!(!table.remove(&key));
        } else {
            assert_eq!(table.find(&key), Some(key));
        }
    }
}

#[test]
fn test_concurrent_mixed_workload() {
    let table: Arc<ExtendibleHashTable<u32, u32>> = Arc::new(ExtendibleHashTable::new(4));

    let mut handles = Vec::new();
    for t in 0..8u32 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            let base = t * 10_000;
            for i in 0..500 {
                table.insert(base + i, i);
            }
            for i in (0..500).step_by(3) {
                assert!(table.remove(&(base + i)));
            }
            for i in 0..500 {
                let found = table.find(&(base + i));
                if i % 3 == 0 {
                    assert_eq!(found, None);
                } else {
                    assert_eq!(found, Some(i));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
