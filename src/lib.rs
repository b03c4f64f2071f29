// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::BPlusTree;
pub use storage::buffer::BufferPoolError;
pub use storage::buffer::BufferPoolManager;
pub use storage::buffer::ExtendibleHashTable;
pub use storage::buffer::LruKReplacer;
pub use storage::disk::DiskManager;
pub use transaction::concurrency::{
    IsolationLevel, LockManager, LockMode, Transaction, TransactionManager, TransactionState,
};
