use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use parking_lot::lock_api::ArcRwLockUpgradableReadGuard;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{
    PageId, PageReadGuard, PageWriteGuard, HEADER_PAGE_ID, INVALID_PAGE_ID,
};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::BTreeIterator;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{HeaderPage, PageError};

/// Concurrent B+Tree index over the buffer pool.
///
/// Every node lives in a page payload; descent takes per-page latches in
/// crabbing order. Operations first try an optimistic descent (read latches
/// down, write latch only on the leaf) and fall back to a pessimistic
/// descent (write latches, ancestors released as soon as a node is safe)
/// when the leaf alone cannot absorb the change.
pub struct BPlusTree<K, V> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    /// Synthetic root latch: guards `root_page_id` so a reader never sees a
    /// transiently missing root. Held until the root page latch is taken.
    root_page_id: RwLock<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _phantom: PhantomData<fn() -> (K, V)>,
}

/// A write-latched node travelling with a pessimistic descent. The
/// deserialized view is written back on release when dirty.
struct LatchedNode<K, V> {
    guard: PageWriteGuard,
    node: BTreeNode<K, V>,
    dirty: bool,
}

/// Latch queue of a pessimistic descent, root-id latch included
struct WriteContext<'a, K, V> {
    root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    latched: Vec<LatchedNode<K, V>>,
}

enum OptimisticResult<K, V> {
    /// The tree has no root
    EmptyTree,
    /// The leaf cannot absorb the change alone; all latches were released
    Retry,
    /// Write-latched leaf that can absorb the change in place
    Leaf(PageWriteGuard, BTreeNode<K, V>),
}

impl<K, V> BPlusTree<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Create an index, registering it in the header page. An index that is
    /// already registered is reattached with its stored root.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 3 && internal_max_size >= 3);
        let index_name = index_name.into();

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root = {
            let mut page = header.write();
            match HeaderPage::get_root_id(&page, &index_name) {
                Some(root) => root,
                None => {
                    HeaderPage::insert_record(&mut page, &index_name, INVALID_PAGE_ID)?;
                    INVALID_PAGE_ID
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: RwLock::new(root),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Reattach an index that must already be registered in the header page
    pub fn open(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 3 && internal_max_size >= 3);
        let index_name = index_name.into();

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root = {
            let page = header.read();
            HeaderPage::get_root_id(&page, &index_name)
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;
        let root = root.ok_or_else(|| PageError::RecordNotFound(index_name.clone()))?;

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: RwLock::new(root),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup; keys are unique so at most one value comes back
    pub fn get_value(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.fetch_read(root_id)?;
        drop(root_latch);

        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let found = node.leaf_lookup(key).cloned();
                self.release_read(guard)?;
                return Ok(found);
            }
            let child = self.fetch_read(node.child_page_for(key))?;
            self.release_read(guard)?;
            guard = child;
        }
    }

    /// Insert a pair; returns false when the key already exists
    pub fn insert(&self, key: &K, value: &V) -> Result<bool, BTreeError> {
        loop {
            match self.optimistic_descent(key, true)? {
                OptimisticResult::EmptyTree => {
                    if let Some(done) = self.try_start_new_tree(key, value)? {
                        return Ok(done);
                    }
                    // lost the race for the first root; go around
                }
                OptimisticResult::Leaf(mut guard, mut node) => {
                    let inserted = node.leaf_insert(key.clone(), value.clone());
                    if inserted {
                        serialize_node(&node, &mut guard)?;
                    }
                    let pid = node.page_id;
                    drop(guard);
                    self.buffer_pool.unpin_page(pid, inserted)?;
                    return Ok(inserted);
                }
                OptimisticResult::Retry => return self.pessimistic_insert(key, value),
            }
        }
    }

    /// Remove a key; a missing key is silently ignored
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        match self.optimistic_descent(key, false)? {
            OptimisticResult::EmptyTree => Ok(()),
            OptimisticResult::Leaf(mut guard, mut node) => {
                let removed = node.leaf_remove(key);
                if removed {
                    serialize_node(&node, &mut guard)?;
                }
                let pid = node.page_id;
                drop(guard);
                self.buffer_pool.unpin_page(pid, removed)?;
                Ok(())
            }
            OptimisticResult::Retry => self.pessimistic_remove(key),
        }
    }

    /// Iterator over the whole tree, starting at the leftmost leaf
    pub fn iter(&self) -> Result<BTreeIterator<K, V>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.buffer_pool)));
        }
        let mut guard = self.fetch_read(root_id)?;
        drop(root_latch);

        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let pid = node.page_id;
                self.release_read(guard)?;
                return Ok(BTreeIterator::new(Arc::clone(&self.buffer_pool), pid, 0));
            }
            let child = self.fetch_read(node.children[0])?;
            self.release_read(guard)?;
            guard = child;
        }
    }

    /// The exhausted iterator sentinel
    pub fn end(&self) -> BTreeIterator<K, V> {
        BTreeIterator::end(Arc::clone(&self.buffer_pool))
    }

    /// Iterator positioned at the first entry with key >= the probe
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K, V>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.buffer_pool)));
        }
        let mut guard = self.fetch_read(root_id)?;
        drop(root_latch);

        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let pid = node.page_id;
                let index = node.leaf_seek(key);
                self.release_read(guard)?;
                return Ok(BTreeIterator::new(Arc::clone(&self.buffer_pool), pid, index));
            }
            let child = self.fetch_read(node.child_page_for(key))?;
            self.release_read(guard)?;
            guard = child;
        }
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// Optimistic descent: upgradable read latches down the path, upgraded
    /// to a write latch on the leaf. Succeeds when the leaf alone can
    /// absorb the change.
    fn optimistic_descent(
        &self,
        key: &K,
        for_insert: bool,
    ) -> Result<OptimisticResult<K, V>, BTreeError> {
        let root_latch = self.root_page_id.read();
        let root_id = *root_latch;
        if root_id == INVALID_PAGE_ID {
            return Ok(OptimisticResult::EmptyTree);
        }
        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.upgradable_read_arc();
        drop(root_latch);

        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let write_guard = ArcRwLockUpgradableReadGuard::upgrade(guard);
                let safe = if for_insert {
                    node.is_insert_safe()
                } else {
                    node.is_remove_safe()
                };
                if safe {
                    return Ok(OptimisticResult::Leaf(write_guard, node));
                }
                let pid = node.page_id;
                drop(write_guard);
                self.buffer_pool.unpin_page(pid, false)?;
                return Ok(OptimisticResult::Retry);
            }

            let child_page = self.buffer_pool.fetch_page(node.child_page_for(key))?;
            let child_guard = child_page.upgradable_read_arc();
            let pid = node.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(pid, false)?;
            guard = child_guard;
        }
    }

    /// Allocate the first root leaf under the root-id write latch.
    /// Returns None when another thread created the root first.
    fn try_start_new_tree(&self, key: &K, value: &V) -> Result<Option<bool>, BTreeError> {
        let mut root_latch = self.root_page_id.write();
        if *root_latch != INVALID_PAGE_ID {
            return Ok(None);
        }

        let (page, page_id) = self.buffer_pool.new_page()?;
        let mut node: BTreeNode<K, V> =
            BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        node.leaf_insert(key.clone(), value.clone());
        {
            let mut guard = page.write();
            serialize_node(&node, &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;

        *root_latch = page_id;
        self.sync_root_record(page_id)?;
        debug!("index {} grew its first root page {}", self.index_name, page_id);
        Ok(Some(true))
    }

    /// Pessimistic insert: write latches down the path, ancestors released
    /// once a node can absorb a split from below
    fn pessimistic_insert(&self, key: &K, value: &V) -> Result<bool, BTreeError> {
        let mut ctx = WriteContext {
            root_guard: Some(self.root_page_id.write()),
            latched: Vec::new(),
        };
        let root_id = **ctx.root_guard.as_ref().expect("root latch");
        if root_id == INVALID_PAGE_ID {
            // the tree emptied since the optimistic pass
            drop(ctx);
            return match self.try_start_new_tree(key, value)? {
                Some(done) => Ok(done),
                None => self.insert(key, value),
            };
        }

        let mut guard = self.fetch_write(root_id)?;
        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_insert_safe() {
                self.release_all(&mut ctx)?;
            }
            let is_leaf = node.is_leaf();
            let child_id = if is_leaf {
                INVALID_PAGE_ID
            } else {
                node.child_page_for(key)
            };
            ctx.latched.push(LatchedNode {
                guard,
                node,
                dirty: false,
            });
            if is_leaf {
                break;
            }
            guard = self.fetch_write(child_id)?;
        }

        let leaf_pos = ctx.latched.len() - 1;
        {
            let leaf = &mut ctx.latched[leaf_pos];
            if !leaf.node.leaf_insert(key.clone(), value.clone()) {
                self.release_all(&mut ctx)?;
                return Ok(false);
            }
            leaf.dirty = true;
            if leaf.node.size() < leaf.node.max_size {
                self.release_all(&mut ctx)?;
                return Ok(true);
            }
        }

        // The leaf hit its maximum: split and push the separator upward
        let (separator, right) = {
            let leaf = &mut ctx.latched[leaf_pos];
            let mut second = leaf.node.split_leaf();
            let (page, new_id) = self.buffer_pool.new_page()?;
            second.page_id = new_id;
            leaf.node.next_page_id = new_id;
            let separator = second.keys[0].clone();
            let guard = page.write_arc();
            (
                separator,
                LatchedNode {
                    guard,
                    node: second,
                    dirty: true,
                },
            )
        };
        self.insert_into_parent(&mut ctx, separator, right)?;
        self.release_all(&mut ctx)?;
        Ok(true)
    }

    /// Wire a freshly split-off node into the parent of the node at the top
    /// of the latch queue, splitting upward as long as parents overflow
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext<'_, K, V>,
        key: K,
        mut right: LatchedNode<K, V>,
    ) -> Result<(), BTreeError> {
        let left_pos = ctx.latched.len() - 1;

        if ctx.latched[left_pos].node.is_root() {
            // Grow a new root with the two halves as children
            let (page, new_root_id) = self.buffer_pool.new_page()?;
            let left = &mut ctx.latched[left_pos];
            let mut root: BTreeNode<K, V> =
                BTreeNode::new_internal(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
            root.children.push(left.node.page_id);
            root.keys.push(key);
            root.children.push(right.node.page_id);
            left.node.parent_id = new_root_id;
            left.dirty = true;
            right.node.parent_id = new_root_id;
            {
                let mut guard = page.write();
                serialize_node(&root, &mut guard)?;
            }
            self.buffer_pool.unpin_page(new_root_id, true)?;
            self.release_latched(right)?;

            let root_guard = ctx
                .root_guard
                .as_mut()
                .expect("root latch held across a root split");
            **root_guard = new_root_id;
            self.sync_root_record(new_root_id)?;
            debug!("index {} grew a new root page {}", self.index_name, new_root_id);
            return Ok(());
        }

        let parent_pos = left_pos - 1;
        debug_assert_eq!(
            ctx.latched[parent_pos].node.page_id,
            ctx.latched[left_pos].node.parent_id
        );
        let left_id = ctx.latched[left_pos].node.page_id;
        let right_id = right.node.page_id;

        if ctx.latched[parent_pos].node.size() < self.internal_max_size {
            let parent = &mut ctx.latched[parent_pos];
            right.node.parent_id = parent.node.page_id;
            parent.node.internal_insert_after(left_id, key, right_id);
            parent.dirty = true;
            self.release_latched(right)?;
            return Ok(());
        }

        // The parent overflows too: insert, split it, and recurse
        let (mid_key, mut new_internal) = {
            let parent = &mut ctx.latched[parent_pos];
            right.node.parent_id = parent.node.page_id;
            parent.node.internal_insert_after(left_id, key, right_id);
            parent.dirty = true;
            parent.node.split_internal()
        };
        let (page, new_internal_id) = self.buffer_pool.new_page()?;
        new_internal.page_id = new_internal_id;
        let new_latched = LatchedNode {
            guard: page.write_arc(),
            node: new_internal,
            dirty: true,
        };

        // Children that moved into the new sibling point at a new parent
        let moved: Vec<PageId> = new_latched.node.children.clone();
        for child_id in moved {
            if child_id == right_id {
                right.node.parent_id = new_internal_id;
            } else {
                self.reassign_parent(ctx, child_id, new_internal_id)?;
            }
        }
        self.release_latched(right)?;

        // The split leaf is settled; drop it so the parent tops the queue
        let finished = ctx.latched.pop().expect("left node latched");
        self.release_latched(finished)?;
        self.insert_into_parent(ctx, mid_key, new_latched)
    }

    /// Pessimistic remove: write latches down the path, ancestors released
    /// once a node can absorb a coalesce from below
    fn pessimistic_remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = WriteContext {
            root_guard: Some(self.root_page_id.write()),
            latched: Vec::new(),
        };
        let root_id = **ctx.root_guard.as_ref().expect("root latch");
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut guard = self.fetch_write(root_id)?;
        loop {
            let node: BTreeNode<K, V> = deserialize_node(&guard)?;
            if node.is_remove_safe() {
                self.release_all(&mut ctx)?;
            }
            let is_leaf = node.is_leaf();
            let child_id = if is_leaf {
                INVALID_PAGE_ID
            } else {
                node.child_page_for(key)
            };
            ctx.latched.push(LatchedNode {
                guard,
                node,
                dirty: false,
            });
            if is_leaf {
                break;
            }
            guard = self.fetch_write(child_id)?;
        }

        self.remove_entry(&mut ctx, key)?;
        self.release_all(&mut ctx)?;
        Ok(())
    }

    /// Remove a key from the node at the top of the latch queue, then fix
    /// any underflow by coalescing with or borrowing from a sibling;
    /// coalescing recurses into the parent
    fn remove_entry(&self, ctx: &mut WriteContext<'_, K, V>, key: &K) -> Result<(), BTreeError> {
        let pos = ctx.latched.len() - 1;
        let removed = {
            let entry = &mut ctx.latched[pos];
            let removed = if entry.node.is_leaf() {
                entry.node.leaf_remove(key)
            } else {
                entry.node.internal_remove(key)
            };
            if removed {
                entry.dirty = true;
            }
            removed
        };
        if !removed {
            return Ok(());
        }

        if ctx.latched[pos].node.is_root() {
            let (is_leaf, size) = {
                let entry = &ctx.latched[pos];
                (entry.node.is_leaf(), entry.node.size())
            };
            if !is_leaf && size == 1 {
                // Promote the single remaining child to root
                let child_id = ctx.latched[pos].node.children[0];
                let old_root = ctx.latched.pop().expect("root latched");
                self.free_latched_page(old_root)?;
                self.reassign_parent(ctx, child_id, INVALID_PAGE_ID)?;
                let root_guard = ctx
                    .root_guard
                    .as_mut()
                    .expect("root latch held across a root change");
                **root_guard = child_id;
                self.sync_root_record(child_id)?;
                debug!("index {} promoted page {} to root", self.index_name, child_id);
            } else if is_leaf && size == 0 {
                let old_root = ctx.latched.pop().expect("root latched");
                self.free_latched_page(old_root)?;
                let root_guard = ctx
                    .root_guard
                    .as_mut()
                    .expect("root latch held across a root change");
                **root_guard = INVALID_PAGE_ID;
                self.sync_root_record(INVALID_PAGE_ID)?;
                debug!("index {} is now empty", self.index_name);
            }
            return Ok(());
        }

        if ctx.latched[pos].node.size() >= ctx.latched[pos].node.min_size() {
            return Ok(());
        }

        // Underflow: the parent must still be latched right above us
        debug_assert!(pos >= 1);
        let node_id = ctx.latched[pos].node.page_id;
        let (adjacent_id, sep_idx, adjacent_is_pred, sep_key) = {
            let parent = &ctx.latched[pos - 1].node;
            let adjacent_id = parent.adjacent_of(node_id);
            let sep_idx = parent.separator_index_between(node_id, adjacent_id);
            let node_pos = parent.child_index_of(node_id).expect("node is a child");
            let adj_pos = parent.child_index_of(adjacent_id).expect("sibling is a child");
            (adjacent_id, sep_idx, adj_pos < node_pos, parent.keys[sep_idx].clone())
        };

        let adj_page = self.buffer_pool.fetch_page(adjacent_id)?;
        let adj_guard = adj_page.write_arc();
        let adj_node: BTreeNode<K, V> = deserialize_node(&adj_guard)?;
        let mut adjacent = LatchedNode {
            guard: adj_guard,
            node: adj_node,
            dirty: false,
        };

        let fits_in_one =
            ctx.latched[pos].node.size() + adjacent.node.size()
                <= ctx.latched[pos].node.single_node_max();

        if fits_in_one {
            // Coalesce into the predecessor and pull the separator out of
            // the parent
            let node_entry = ctx.latched.pop().expect("node latched");
            if adjacent_is_pred {
                self.coalesce(ctx, &mut adjacent, node_entry, &sep_key)?;
                self.release_latched(adjacent)?;
            } else {
                let mut node_entry = node_entry;
                self.coalesce(ctx, &mut node_entry, adjacent, &sep_key)?;
                self.release_latched(node_entry)?;
            }
            return self.remove_entry(ctx, &sep_key);
        }

        // Redistribute: move one entry across the boundary
        let mut moved_child: Option<PageId> = None;
        {
            let (head, tail) = ctx.latched.split_at_mut(pos);
            let parent = &mut head[pos - 1];
            let entry = &mut tail[0];
            if adjacent_is_pred {
                if entry.node.is_leaf() {
                    let k = adjacent.node.keys.pop().expect("sibling entry");
                    let v = adjacent.node.values.pop().expect("sibling entry");
                    parent.node.keys[sep_idx] = k.clone();
                    entry.node.keys.insert(0, k);
                    entry.node.values.insert(0, v);
                } else {
                    let child = adjacent.node.children.pop().expect("sibling child");
                    let k = adjacent.node.keys.pop().expect("sibling entry");
                    entry.node.keys.insert(0, sep_key.clone());
                    entry.node.children.insert(0, child);
                    parent.node.keys[sep_idx] = k;
                    moved_child = Some(child);
                }
            } else if entry.node.is_leaf() {
                let k = adjacent.node.keys.remove(0);
                let v = adjacent.node.values.remove(0);
                entry.node.keys.push(k);
                entry.node.values.push(v);
                parent.node.keys[sep_idx] = adjacent.node.keys[0].clone();
            } else {
                let child = adjacent.node.children.remove(0);
                let k = adjacent.node.keys.remove(0);
                entry.node.keys.push(sep_key.clone());
                entry.node.children.push(child);
                parent.node.keys[sep_idx] = k;
                moved_child = Some(child);
            }
            parent.dirty = true;
            entry.dirty = true;
            adjacent.dirty = true;
        }
        if let Some(child) = moved_child {
            self.reassign_parent(ctx, child, node_id)?;
        }
        self.release_latched(adjacent)?;
        Ok(())
    }

    /// Move every entry of `succ` into `pred` (its left neighbor) and free
    /// the successor's page. Internal merges pull the parent separator down
    /// and rewire the moved children.
    fn coalesce(
        &self,
        ctx: &mut WriteContext<'_, K, V>,
        pred: &mut LatchedNode<K, V>,
        succ: LatchedNode<K, V>,
        sep_key: &K,
    ) -> Result<(), BTreeError> {
        let LatchedNode {
            guard: succ_guard,
            node: succ_node,
            ..
        } = succ;

        if pred.node.is_leaf() {
            pred.node.keys.extend(succ_node.keys);
            pred.node.values.extend(succ_node.values);
            pred.node.next_page_id = succ_node.next_page_id;
        } else {
            pred.node.keys.push(sep_key.clone());
            pred.node.keys.extend(succ_node.keys);
            let moved = succ_node.children.clone();
            pred.node.children.extend(succ_node.children);
            for child in moved {
                self.reassign_parent(ctx, child, pred.node.page_id)?;
            }
        }
        pred.dirty = true;

        let succ_id = succ_node.page_id;
        drop(succ_guard);
        self.buffer_pool.unpin_page(succ_id, false)?;
        self.buffer_pool.delete_page(succ_id)?;
        debug!("index {} coalesced page {} away", self.index_name, succ_id);
        Ok(())
    }

    /// Update a child's stored parent pointer, using its latched view when
    /// the child sits in the latch queue
    fn reassign_parent(
        &self,
        ctx: &mut WriteContext<'_, K, V>,
        child_id: PageId,
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        if let Some(entry) = ctx
            .latched
            .iter_mut()
            .find(|entry| entry.node.page_id == child_id)
        {
            entry.node.parent_id = parent_id;
            entry.dirty = true;
            return Ok(());
        }

        let page = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = page.write();
            let mut node: BTreeNode<K, V> = deserialize_node(&guard)?;
            node.parent_id = parent_id;
            serialize_node(&node, &mut guard)?;
        }
        self.buffer_pool.unpin_page(child_id, true)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page plumbing
    // ------------------------------------------------------------------

    fn fetch_read(&self, page_id: PageId) -> Result<PageReadGuard, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        Ok(page.read_arc())
    }

    fn fetch_write(&self, page_id: PageId) -> Result<PageWriteGuard, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        Ok(page.write_arc())
    }

    fn release_read(&self, guard: PageReadGuard) -> Result<(), BTreeError> {
        let pid = guard.page_id;
        drop(guard);
        self.buffer_pool.unpin_page(pid, false)?;
        Ok(())
    }

    /// Write back a latched node when dirty, then unlatch and unpin
    fn release_latched(&self, mut entry: LatchedNode<K, V>) -> Result<(), BTreeError> {
        if entry.dirty {
            serialize_node(&entry.node, &mut entry.guard)?;
        }
        let pid = entry.node.page_id;
        let dirty = entry.dirty;
        drop(entry.guard);
        self.buffer_pool.unpin_page(pid, dirty)?;
        Ok(())
    }

    /// Unlatch, unpin and free a page that left the tree
    fn free_latched_page(&self, entry: LatchedNode<K, V>) -> Result<(), BTreeError> {
        let pid = entry.node.page_id;
        drop(entry.guard);
        self.buffer_pool.unpin_page(pid, false)?;
        self.buffer_pool.delete_page(pid)?;
        Ok(())
    }

    /// Release the root-id latch and every latched ancestor
    fn release_all(&self, ctx: &mut WriteContext<'_, K, V>) -> Result<(), BTreeError> {
        ctx.root_guard = None;
        while let Some(entry) = ctx.latched.pop() {
            self.release_latched(entry)?;
        }
        Ok(())
    }

    /// Mirror a root change into the header page registry
    fn sync_root_record(&self, root: PageId) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = header.write();
            HeaderPage::update_record(&mut page, &self.index_name, root)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }
}
