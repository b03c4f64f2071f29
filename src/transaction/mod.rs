pub mod concurrency;

// Public exports
pub use concurrency::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionAbort,
    TransactionManager, TransactionState,
};
