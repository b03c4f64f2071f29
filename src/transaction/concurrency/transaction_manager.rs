use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("Transaction {0} not found")]
    NotFound(TxnId),
}

/// Creates and tracks transactions, and drives their terminal transitions.
/// Commit and abort set the final state first, then hand every held lock
/// back to the lock manager (rows before tables).
pub struct TransactionManager {
    /// Next transaction ID to assign
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    /// Active transactions map (txn_id -> transaction)
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            lock_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction in the GROWING state
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.lock().insert(txn_id, Arc::clone(&txn));
        debug!("txn {} began ({:?})", txn_id, isolation_level);
        txn
    }

    /// Commit: terminal state, then release every held lock
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()));
            }
            _ => {}
        }
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all_locks(txn);
        self.active.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Abort: terminal state, then release every held lock. Aborting a
    /// transaction the deadlock detector already marked ABORTED is the
    /// normal unwind path, not an error.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
        self.active.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_manager() -> TransactionManager {
        TransactionManager::new(LockManager::new(Duration::from_millis(50)))
    }

    #[test]
    fn test_begin_assigns_monotonic_ids() {
        let tm = make_manager();
        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::ReadCommitted);
        assert!(t1.id() > t0.id());
        assert_eq!(t0.state(), TransactionState::Growing);
        assert_eq!(tm.active_transaction_ids().len(), 2);
    }

    #[test]
    fn test_commit_finalizes() {
        let tm = make_manager();
        let txn = tm.begin(IsolationLevel::RepeatableRead);
        tm.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(tm.get_transaction(txn.id()).is_none());

        assert!(tm.commit(&txn).is_err());
        assert!(tm.abort(&txn).is_err());
    }

    #[test]
    fn test_abort_is_idempotent_for_victims() {
        let tm = make_manager();
        let txn = tm.begin(IsolationLevel::RepeatableRead);
        // The detector may have marked the transaction before the caller
        // unwinds to the abort call
        txn.set_state(TransactionState::Aborted);
        tm.abort(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(tm.get_transaction(txn.id()).is_none());
    }
}
