use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states under strict two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Categorized reason the lock manager aborted a transaction
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while shrinking")]
    LockOnShrinking,
    #[error("conflicting lock upgrade in flight")]
    UpgradeConflict,
    #[error("incompatible lock upgrade")]
    IncompatibleUpgrade,
    #[error("intention lock attempted on a row")]
    AttemptedIntentionLockOnRow,
    #[error("no suitable table lock for the row lock")]
    TableLockNotPresent,
    #[error("unlock attempted with no lock held")]
    AttemptedUnlockButNoLockHeld,
    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,
    #[error("shared lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// Error surfaced to the caller whose transaction was aborted.
/// The transaction's state is already ABORTED when this is returned; the
/// transaction manager releases the held locks.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// An active transaction: identity, isolation level, 2PL state and the
/// sets of locks it currently holds. State and lock sets share one mutex
/// so concurrent callers (including the deadlock detector) see a
/// consistent view.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    inner: Mutex<TxnInner>,
}

#[derive(Default)]
struct TxnInner {
    state: TransactionState,
    shared_table_locks: HashSet<TableOid>,
    exclusive_table_locks: HashSet<TableOid>,
    intention_shared_table_locks: HashSet<TableOid>,
    intention_exclusive_table_locks: HashSet<TableOid>,
    shared_intention_exclusive_table_locks: HashSet<TableOid>,
    shared_row_locks: HashMap<TableOid, HashSet<Rid>>,
    exclusive_row_locks: HashMap<TableOid, HashSet<Rid>>,
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState::Growing
    }
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            inner: Mutex::new(TxnInner::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }

    /// Mode of the table lock this transaction holds on `oid`, if any
    pub fn held_table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let inner = self.inner.lock();
        if inner.shared_table_locks.contains(&oid) {
            Some(LockMode::Shared)
        } else if inner.exclusive_table_locks.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if inner.intention_shared_table_locks.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else if inner.intention_exclusive_table_locks.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if inner.shared_intention_exclusive_table_locks.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else {
            None
        }
    }

    /// Mode of the row lock this transaction holds on `(oid, rid)`, if any
    pub fn held_row_lock_mode(&self, oid: TableOid, rid: Rid) -> Option<LockMode> {
        let inner = self.inner.lock();
        if inner
            .shared_row_locks
            .get(&oid)
            .is_some_and(|rids| rids.contains(&rid))
        {
            Some(LockMode::Shared)
        } else if inner
            .exclusive_row_locks
            .get(&oid)
            .is_some_and(|rids| rids.contains(&rid))
        {
            Some(LockMode::Exclusive)
        } else {
            None
        }
    }

    pub fn record_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut inner = self.inner.lock();
        inner.table_set_mut(mode).insert(oid);
    }

    pub fn erase_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut inner = self.inner.lock();
        inner.table_set_mut(mode).remove(&oid);
    }

    pub fn record_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut inner = self.inner.lock();
        inner.row_set_mut(mode).entry(oid).or_default().insert(rid);
    }

    pub fn erase_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut inner = self.inner.lock();
        if let Some(rids) = inner.row_set_mut(mode).get_mut(&oid) {
            rids.remove(&rid);
        }
    }

    /// Whether any row lock of this transaction still lives under `oid`
    pub fn is_locking_rows_of(&self, oid: TableOid) -> bool {
        let inner = self.inner.lock();
        inner
            .shared_row_locks
            .get(&oid)
            .is_some_and(|rids| !rids.is_empty())
            || inner
                .exclusive_row_locks
                .get(&oid)
                .is_some_and(|rids| !rids.is_empty())
    }

    /// Total number of table locks currently held
    pub fn table_lock_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.shared_table_locks.len()
            + inner.exclusive_table_locks.len()
            + inner.intention_shared_table_locks.len()
            + inner.intention_exclusive_table_locks.len()
            + inner.shared_intention_exclusive_table_locks.len()
    }

    /// Total number of row locks currently held
    pub fn row_lock_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.shared_row_locks.values().map(HashSet::len).sum::<usize>()
            + inner.exclusive_row_locks.values().map(HashSet::len).sum::<usize>()
    }

    /// Drain every lock set, returning the row locks and the table locks
    /// held at this instant. Used when a transaction commits or aborts.
    #[allow(clippy::type_complexity)]
    pub fn take_all_locks(&self) -> (Vec<(LockMode, TableOid, Rid)>, Vec<(LockMode, TableOid)>) {
        let mut inner = self.inner.lock();
        let mut rows = Vec::new();
        for (mode, set) in [
            (LockMode::Shared, std::mem::take(&mut inner.shared_row_locks)),
            (
                LockMode::Exclusive,
                std::mem::take(&mut inner.exclusive_row_locks),
            ),
        ] {
            for (oid, rids) in set {
                for rid in rids {
                    rows.push((mode, oid, rid));
                }
            }
        }

        let mut tables = Vec::new();
        for (mode, set) in [
            (LockMode::Shared, std::mem::take(&mut inner.shared_table_locks)),
            (
                LockMode::Exclusive,
                std::mem::take(&mut inner.exclusive_table_locks),
            ),
            (
                LockMode::IntentionShared,
                std::mem::take(&mut inner.intention_shared_table_locks),
            ),
            (
                LockMode::IntentionExclusive,
                std::mem::take(&mut inner.intention_exclusive_table_locks),
            ),
            (
                LockMode::SharedIntentionExclusive,
                std::mem::take(&mut inner.shared_intention_exclusive_table_locks),
            ),
        ] {
            for oid in set {
                tables.push((mode, oid));
            }
        }

        (rows, tables)
    }
}

impl TxnInner {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_table_locks,
            LockMode::Exclusive => &mut self.exclusive_table_locks,
            LockMode::IntentionShared => &mut self.intention_shared_table_locks,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table_locks,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_table_locks,
        }
    }

    fn row_set_mut(&mut self, mode: LockMode) -> &mut HashMap<TableOid, HashSet<Rid>> {
        match mode {
            LockMode::Shared => &mut self.shared_row_locks,
            LockMode::Exclusive => &mut self.exclusive_row_locks,
            _ => unreachable!("row locks are only shared or exclusive"),
        }
    }
}
