use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;

/// Forward iterator over the leaf chain.
///
/// The iterator holds no latch between advances: every step re-fetches its
/// current leaf, copies one entry out under the read latch and unpins the
/// page again before yielding.
pub struct BTreeIterator<K, V> {
    buffer_pool: Arc<BufferPoolManager>,
    page_id: PageId,
    index: usize,
    _phantom: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BTreeIterator<K, V> {
    pub(crate) fn new(buffer_pool: Arc<BufferPoolManager>, page_id: PageId, index: usize) -> Self {
        Self {
            buffer_pool,
            page_id,
            index,
            _phantom: PhantomData,
        }
    }

    /// The exhausted sentinel
    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self::new(buffer_pool, INVALID_PAGE_ID, 0)
    }

    pub fn is_end(&self) -> bool {
        self.page_id == INVALID_PAGE_ID
    }
}

impl<K, V> Iterator for BTreeIterator<K, V>
where
    K: Ord + Clone + DeserializeOwned,
    V: Clone + DeserializeOwned,
{
    type Item = Result<(K, V), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return None;
            }

            let page = match self.buffer_pool.fetch_page(self.page_id) {
                Ok(page) => page,
                Err(e) => {
                    self.page_id = INVALID_PAGE_ID;
                    return Some(Err(e.into()));
                }
            };
            let node: BTreeNode<K, V> = {
                let guard = page.read();
                match deserialize_node(&guard) {
                    Ok(node) => node,
                    Err(e) => {
                        drop(guard);
                        let _ = self.buffer_pool.unpin_page(self.page_id, false);
                        self.page_id = INVALID_PAGE_ID;
                        return Some(Err(e));
                    }
                }
            };
            if let Err(e) = self.buffer_pool.unpin_page(self.page_id, false) {
                self.page_id = INVALID_PAGE_ID;
                return Some(Err(e.into()));
            }

            if self.index < node.keys.len() {
                let item = (
                    node.keys[self.index].clone(),
                    node.values[self.index].clone(),
                );
                self.index += 1;
                return Some(Ok(item));
            }

            // Past the last entry of this leaf: follow the chain
            self.page_id = node.next_page_id;
            self.index = 0;
        }
    }
}
