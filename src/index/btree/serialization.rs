use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, NodeType};

// Node page layout:
// - node_type: u8 (1 = leaf, 2 = internal)
// - max_size: u16
// - parent_id: u32
// - next_page_id: u32 (leaf chain; INVALID for internal nodes)
// - body_len: u32
// - body: bincode of (keys, values, children)
const TYPE_LEAF: u8 = 1;
const TYPE_INTERNAL: u8 = 2;
const HEADER_SIZE: usize = 15;

/// Serialize a tree node into a page payload
pub fn serialize_node<K, V>(node: &BTreeNode<K, V>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize,
    V: Serialize,
{
    let body = bincode::serialize(&(&node.keys, &node.values, &node.children))
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if HEADER_SIZE + body.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    page.data.fill(0);
    page.data[0] = match node.node_type {
        NodeType::Leaf => TYPE_LEAF,
        NodeType::Internal => TYPE_INTERNAL,
    };
    LittleEndian::write_u16(&mut page.data[1..3], node.max_size as u16);
    LittleEndian::write_u32(&mut page.data[3..7], node.parent_id);
    LittleEndian::write_u32(&mut page.data[7..11], node.next_page_id);
    LittleEndian::write_u32(&mut page.data[11..15], body.len() as u32);
    page.data[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(&body);

    Ok(())
}

/// Deserialize a tree node from a page payload
pub fn deserialize_node<K, V>(page: &Page) -> Result<BTreeNode<K, V>, BTreeError>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let node_type = match page.data[0] {
        TYPE_LEAF => NodeType::Leaf,
        TYPE_INTERNAL => NodeType::Internal,
        _ => return Err(BTreeError::InvalidPageFormat),
    };
    let max_size = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let parent_id = LittleEndian::read_u32(&page.data[3..7]);
    let next_page_id = LittleEndian::read_u32(&page.data[7..11]);
    let body_len = LittleEndian::read_u32(&page.data[11..15]) as usize;
    if HEADER_SIZE + body_len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }

    let (keys, values, children): (Vec<K>, Vec<V>, Vec<PageId>) =
        bincode::deserialize(&page.data[HEADER_SIZE..HEADER_SIZE + body_len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;

    Ok(BTreeNode {
        node_type,
        page_id: page.page_id,
        parent_id,
        max_size,
        keys,
        values,
        children,
        next_page_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_leaf_round_trip() {
        let mut node: BTreeNode<i64, u32> = BTreeNode::new_leaf(4, 2, 6);
        node.leaf_insert(5, 50);
        node.leaf_insert(9, 90);
        node.next_page_id = 11;

        let mut page = Page::new(4);
        serialize_node(&node, &mut page).unwrap();
        let back: BTreeNode<i64, u32> = deserialize_node(&page).unwrap();

        assert_eq!(back.node_type, NodeType::Leaf);
        assert_eq!(back.page_id, 4);
        assert_eq!(back.parent_id, 2);
        assert_eq!(back.max_size, 6);
        assert_eq!(back.keys, vec![5, 9]);
        assert_eq!(back.values, vec![50, 90]);
        assert_eq!(back.next_page_id, 11);
    }

    #[test]
    fn test_internal_round_trip() {
        let mut node: BTreeNode<i64, u32> = BTreeNode::new_internal(7, INVALID_PAGE_ID, 5);
        node.keys = vec![10, 20];
        node.children = vec![1, 2, 3];

        let mut page = Page::new(7);
        serialize_node(&node, &mut page).unwrap();
        let back: BTreeNode<i64, u32> = deserialize_node(&page).unwrap();

        assert_eq!(back.node_type, NodeType::Internal);
        assert!(back.is_root());
        assert_eq!(back.keys, vec![10, 20]);
        assert_eq!(back.children, vec![1, 2, 3]);
        assert!(back.values.is_empty());
    }

    #[test]
    fn test_string_keys_round_trip() {
        let mut node: BTreeNode<String, u32> = BTreeNode::new_leaf(1, INVALID_PAGE_ID, 4);
        node.leaf_insert("cherry".to_string(), 3);
        node.leaf_insert("apple".to_string(), 1);

        let mut page = Page::new(1);
        serialize_node(&node, &mut page).unwrap();
        let back: BTreeNode<String, u32> = deserialize_node(&page).unwrap();
        assert_eq!(back.keys, vec!["apple".to_string(), "cherry".to_string()]);
    }

    #[test]
    fn test_zeroed_page_rejected() {
        let page = Page::new(1);
        let res: Result<BTreeNode<i64, u32>, _> = deserialize_node(&page);
        assert!(matches!(res, Err(BTreeError::InvalidPageFormat)));
    }

    #[test]
    fn test_oversized_node_rejected() {
        let mut node: BTreeNode<String, u32> = BTreeNode::new_leaf(1, INVALID_PAGE_ID, 4096);
        for i in 0..200 {
            node.leaf_insert(format!("key-{:05}-{}", i, "x".repeat(64)), i);
        }
        let mut page = Page::new(1);
        assert!(matches!(
            serialize_node(&node, &mut page),
            Err(BTreeError::NodeTooLarge)
        ));
    }
}
