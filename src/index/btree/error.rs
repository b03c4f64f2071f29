use thiserror::Error;

use crate::storage::buffer::BufferPoolError;
use crate::storage::page::PageError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("Header page error: {0}")]
    Header(#[from] PageError),

    #[error("Failed to serialize node: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize node: {0}")]
    DeserializationError(String),

    #[error("Node does not fit in a page")]
    NodeTooLarge,

    #[error("Page is not a tree node")]
    InvalidPageFormat,
}
