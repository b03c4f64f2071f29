use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::types::{FrameId, PageId};

/// User-supplied hash for directory keys.
///
/// Integer keys hash to their own value, which keeps the directory layout a
/// pure function of the inserted keys.
pub trait HashKey {
    fn hash_key(&self) -> u64;
}

impl HashKey for u32 {
    fn hash_key(&self) -> u64 {
        *self as u64
    }
}

impl HashKey for u64 {
    fn hash_key(&self) -> u64 {
        *self
    }
}

impl HashKey for usize {
    fn hash_key(&self) -> u64 {
        *self as u64
    }
}

impl HashKey for i32 {
    fn hash_key(&self) -> u64 {
        *self as u32 as u64
    }
}

/// Extendible hash table used as the buffer pool's page directory
/// (page ID to frame ID). The directory is a vector of `2^global_depth`
/// bucket references; splitting a full bucket doubles the directory only
/// when the bucket's local depth has caught up with the global depth.
pub struct ExtendibleHashTable<K, V> {
    bucket_capacity: usize,
    dir: RwLock<Directory<K, V>>,
}

struct Directory<K, V> {
    global_depth: u32,
    num_buckets: usize,
    slots: Vec<Arc<Bucket<K, V>>>,
}

struct Bucket<K, V> {
    inner: RwLock<BucketInner<K, V>>,
}

struct BucketInner<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(capacity: usize, local_depth: u32) -> Self {
        Self {
            inner: RwLock::new(BucketInner {
                local_depth,
                items: Vec::with_capacity(capacity),
            }),
        }
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: HashKey + Eq + Copy,
    V: Copy,
{
    pub fn new(bucket_capacity: usize) -> Self {
        assert!(bucket_capacity >= 1);
        Self {
            bucket_capacity,
            dir: RwLock::new(Directory {
                global_depth: 0,
                num_buckets: 1,
                slots: vec![Arc::new(Bucket::new(bucket_capacity, 0))],
            }),
        }
    }

    /// Look up the value stored under a key
    pub fn find(&self, key: &K) -> Option<V> {
        let dir = self.dir.read();
        let bucket = &dir.slots[Self::slot_index(key, dir.global_depth)];
        let inner = bucket.inner.read();
        inner.items.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// Insert a pair, overwriting any existing value for the key.
    /// A full bucket is split, doubling the directory when its local depth
    /// equals the global depth; splits repeat until the pair fits.
    pub fn insert(&self, key: K, value: V) {
        let mut dir = self.dir.write();
        loop {
            let index = Self::slot_index(&key, dir.global_depth);
            let bucket = Arc::clone(&dir.slots[index]);
            let old_depth = {
                let mut inner = bucket.inner.write();
                if let Some(slot) = inner.items.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = value;
                    return;
                }
                if inner.items.len() < self.bucket_capacity {
                    inner.items.push((key, value));
                    return;
                }
                inner.local_depth
            };

            // The bucket is full: split it and retry
            if old_depth == dir.global_depth {
                let old_len = dir.slots.len();
                for i in 0..old_len {
                    let clone = Arc::clone(&dir.slots[i]);
                    dir.slots.push(clone);
                }
                dir.global_depth += 1;
            }
            let new_depth = old_depth + 1;

            let drained = {
                let mut inner = bucket.inner.write();
                inner.local_depth = new_depth;
                std::mem::take(&mut inner.items)
            };
            let sibling = Arc::new(Bucket::new(self.bucket_capacity, new_depth));

            // Rewrite the slots that referenced the split bucket: those whose
            // new high-order depth bit is set move to the sibling
            let low_pattern = index as u64 & ((1 << old_depth) - 1);
            let high_bit = 1u64 << old_depth;
            for (slot_idx, slot) in dir.slots.iter_mut().enumerate() {
                let idx = slot_idx as u64;
                if idx & (high_bit - 1) == low_pattern && idx & high_bit != 0 {
                    *slot = Arc::clone(&sibling);
                }
            }
            dir.num_buckets += 1;

            // Redistribute the drained pairs between the two halves
            for (k, v) in drained {
                let target = &dir.slots[Self::slot_index(&k, dir.global_depth)];
                target.inner.write().items.push((k, v));
            }
        }
    }

    /// Remove a key; returns whether it was present.
    /// Buckets are never merged back.
    pub fn remove(&self, key: &K) -> bool {
        let dir = self.dir.read();
        let bucket = &dir.slots[Self::slot_index(key, dir.global_depth)];
        let mut inner = bucket.inner.write();
        match inner.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                inner.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.dir.read().global_depth
    }

    /// Local depth of the bucket referenced by a directory slot
    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let dir = self.dir.read();
        let local_depth = dir.slots[dir_index].inner.read().local_depth;
        local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.dir.read().num_buckets
    }

    fn slot_index(key: &K, global_depth: u32) -> usize {
        let mask = (1u64 << global_depth) - 1;
        (key.hash_key() & mask) as usize
    }
}

// The buffer pool's concrete directory instantiation
pub type PageTable = ExtendibleHashTable<PageId, FrameId>;
