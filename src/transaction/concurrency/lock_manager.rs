use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbort, TransactionState,
};

/// Lock modes of the hierarchical protocol. Tables take all five; rows take
/// only `Shared` and `Exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Standard compatibility matrix
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (IntentionExclusive, _) | (_, IntentionExclusive) => false,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Permitted upgrade lattice:
    /// IS -> {S, X, IX, SIX}, S -> {X, SIX}, IX -> {X, SIX}, SIX -> {X}
    pub fn can_upgrade_to(self, new_mode: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => new_mode != IntentionShared,
            Shared | IntentionExclusive => {
                matches!(new_mode, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => new_mode == Exclusive,
            Exclusive => false,
        }
    }
}

/// One entry in a resource's FIFO request queue
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// At most one transaction may be upgrading on a resource at a time
    upgrading: Option<TxnId>,
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        })
    }
}

/// Hierarchical two-phase lock manager.
///
/// One FIFO request queue per resource (table oid or row rid). A request is
/// granted when it is compatible with every request ahead of it; upgrades
/// are repositioned ahead of other waiters. A background detector rebuilds
/// the waits-for graph on an interval and aborts the youngest transaction
/// of any cycle.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    /// Waits-for edges, rebuilt by the detector; also driven directly by
    /// the test surface (`add_edge`/`remove_edge`/`has_cycle`)
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
    running: AtomicBool,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Build the lock manager and start its deadlock-detector thread
    pub fn new(cycle_detection_interval: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(true),
            detector: Mutex::new(None),
        });

        let weak: Weak<LockManager> = Arc::downgrade(&manager);
        let handle = thread::Builder::new()
            .name("deadlock-detector".into())
            .spawn(move || loop {
                // Parked rather than slept so shutdown can interrupt the wait
                thread::park_timeout(cycle_detection_interval);
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if !manager.running.load(Ordering::Acquire) {
                    break;
                }
                manager.run_detection_pass();
            })
            .expect("failed to spawn the deadlock detector");
        *manager.detector.lock() = Some(handle);

        manager
    }

    /// Stop the detector thread and wait for it to exit
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.detector.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Table locks
    // ------------------------------------------------------------------

    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionAbort> {
        trace!("txn {} requests {:?} on table {}", txn.id(), mode, oid);
        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        self.check_isolation_rules(txn, mode)
            .map_err(|reason| self.abort_txn(txn, reason))?;

        let queue = self.table_queue(oid);
        match txn.held_table_lock_mode(oid) {
            Some(held) if held == mode => return Ok(()),
            Some(held) => {
                if !held.can_upgrade_to(mode) {
                    return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
                }
                self.claim_upgrade_slot(txn, &queue)?;
                txn.erase_table_lock(held, oid);
                self.upgrade_in_queue(txn, &queue, mode)?;
            }
            None => self.acquire_in_queue(txn, &queue, mode)?,
        }

        txn.record_table_lock(mode, oid);
        trace!("txn {} granted {:?} on table {}", txn.id(), mode, oid);
        Ok(())
    }

    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<(), TransactionAbort> {
        let Some(held) = txn.held_table_lock_mode(oid) else {
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.is_locking_rows_of(oid) {
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let queue = self.table_queue(oid);
        self.remove_request(&queue, txn.id());
        txn.erase_table_lock(held, oid);
        self.apply_unlock_state_transition(txn, held)?;
        trace!("txn {} released {:?} on table {}", txn.id(), held, oid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row locks
    // ------------------------------------------------------------------

    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbort> {
        trace!("txn {} requests {:?} on row {}", txn.id(), mode, rid);
        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(self.abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_isolation_rules(txn, mode)
            .map_err(|reason| self.abort_txn(txn, reason))?;

        // Multilevel requirement: the table must already carry a suitable
        // lock of this same transaction
        let table_ok = match mode {
            LockMode::Shared => txn.held_table_lock_mode(oid).is_some(),
            LockMode::Exclusive => matches!(
                txn.held_table_lock_mode(oid),
                Some(
                    LockMode::IntentionExclusive
                        | LockMode::SharedIntentionExclusive
                        | LockMode::Exclusive
                )
            ),
            _ => unreachable!(),
        };
        if !table_ok {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        let queue = self.row_queue(rid);
        match txn.held_row_lock_mode(oid, rid) {
            Some(held) if held == mode => return Ok(()),
            Some(held) => {
                if !held.can_upgrade_to(mode) {
                    return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
                }
                self.claim_upgrade_slot(txn, &queue)?;
                txn.erase_row_lock(held, oid, rid);
                self.upgrade_in_queue(txn, &queue, mode)?;
            }
            None => self.acquire_in_queue(txn, &queue, mode)?,
        }

        txn.record_row_lock(mode, oid, rid);
        trace!("txn {} granted {:?} on row {}", txn.id(), mode, rid);
        Ok(())
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbort> {
        let Some(held) = txn.held_row_lock_mode(oid, rid) else {
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let queue = self.row_queue(rid);
        self.remove_request(&queue, txn.id());
        txn.erase_row_lock(held, oid, rid);
        self.apply_unlock_state_transition(txn, held)?;
        trace!("txn {} released {:?} on row {}", txn.id(), held, rid);
        Ok(())
    }

    /// Release every lock a finished transaction still holds, rows before
    /// tables. No 2PL state transitions fire; the transaction is already
    /// COMMITTED or ABORTED.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = txn.take_all_locks();
        for (_, _, rid) in rows {
            if let Some(queue) = self.row_lock_map.lock().get(&rid).cloned() {
                self.remove_request(&queue, txn.id());
            }
        }
        for (_, oid) in tables {
            if let Some(queue) = self.table_lock_map.lock().get(&oid).cloned() {
                self.remove_request(&queue, txn.id());
            }
        }
    }

    // ------------------------------------------------------------------
    // Queue discipline
    // ------------------------------------------------------------------

    /// Append a request and block until it is granted or the transaction
    /// is aborted
    fn acquire_in_queue(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        mode: LockMode,
    ) -> Result<(), TransactionAbort> {
        let mut state = queue.state.lock();
        state.requests.push_back(LockRequest {
            txn: Arc::clone(txn),
            mode,
            granted: false,
        });
        self.wait_until_granted(txn, queue, &mut state, mode)
    }

    /// Reserve the resource's single upgrade slot, or abort the second
    /// upgrader. Claimed before the held lock is surrendered so a refused
    /// upgrade leaves the original grant intact.
    fn claim_upgrade_slot(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
    ) -> Result<(), TransactionAbort> {
        let mut state = queue.state.lock();
        if state.upgrading.is_some() {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
        }
        state.upgrading = Some(txn.id());
        Ok(())
    }

    /// Reposition an upgrade ahead of other waiters (behind the granted
    /// prefix) and block until it is granted. The upgrade slot is already
    /// claimed by this transaction.
    fn upgrade_in_queue(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        new_mode: LockMode,
    ) -> Result<(), TransactionAbort> {
        let mut state = queue.state.lock();
        debug_assert_eq!(state.upgrading, Some(txn.id()));

        // Drop the held request; waiters behind it may become grantable
        if let Some(pos) = state.requests.iter().position(|r| r.txn.id() == txn.id()) {
            state.requests.remove(pos);
            queue.cv.notify_all();
        }
        let insert_at = state
            .requests
            .iter()
            .position(|r| !r.granted)
            .unwrap_or(state.requests.len());
        state.requests.insert(
            insert_at,
            LockRequest {
                txn: Arc::clone(txn),
                mode: new_mode,
                granted: false,
            },
        );

        let result = self.wait_until_granted(txn, queue, &mut state, new_mode);
        state.upgrading = None;
        result
    }

    /// Grant rule: a request is granted once every request ahead of it in
    /// the queue is compatible with it. Blocks on the queue condvar,
    /// re-checking grantability and the ABORTED flag on every wake.
    fn wait_until_granted(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        state: &mut MutexGuard<'_, QueueState>,
        mode: LockMode,
    ) -> Result<(), TransactionAbort> {
        loop {
            if txn.state() == TransactionState::Aborted {
                // Woken as a deadlock victim: withdraw and pass the turn on
                if let Some(pos) = state
                    .requests
                    .iter()
                    .position(|r| r.txn.id() == txn.id() && !r.granted)
                {
                    state.requests.remove(pos);
                }
                queue.cv.notify_all();
                debug!("txn {} unwinds from a lock wait after abort", txn.id());
                return Err(TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }

            let pos = state
                .requests
                .iter()
                .position(|r| r.txn.id() == txn.id() && !r.granted)
                .expect("waiting request stays queued");
            let grantable = state
                .requests
                .iter()
                .take(pos)
                .all(|ahead| ahead.mode.is_compatible_with(mode));
            if grantable {
                state.requests[pos].granted = true;
                return Ok(());
            }

            queue.cv.wait(state);
        }
    }

    /// Remove a transaction's request from a queue and wake the waiters
    fn remove_request(&self, queue: &Arc<LockRequestQueue>, txn_id: TxnId) -> bool {
        let mut state = queue.state.lock();
        let Some(pos) = state.requests.iter().position(|r| r.txn.id() == txn_id) else {
            return false;
        };
        state.requests.remove(pos);
        queue.cv.notify_all();
        true
    }

    // ------------------------------------------------------------------
    // Isolation rules
    // ------------------------------------------------------------------

    fn check_isolation_rules(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), AbortReason> {
        let state = txn.state();
        match txn.isolation_level() {
            // All modes while growing; nothing while shrinking
            IsolationLevel::RepeatableRead => {
                if state != TransactionState::Growing {
                    return Err(AbortReason::LockOnShrinking);
                }
            }
            // All modes while growing; only IS and S while shrinking
            IsolationLevel::ReadCommitted => {
                let shrinking_ok = state == TransactionState::Shrinking
                    && matches!(mode, LockMode::IntentionShared | LockMode::Shared);
                if state != TransactionState::Growing && !shrinking_ok {
                    return Err(AbortReason::LockOnShrinking);
                }
            }
            // Only IX and X, and only while growing
            IsolationLevel::ReadUncommitted => {
                if !matches!(mode, LockMode::IntentionExclusive | LockMode::Exclusive) {
                    return Err(AbortReason::LockSharedOnReadUncommitted);
                }
                if state != TransactionState::Growing {
                    return Err(AbortReason::LockOnShrinking);
                }
            }
        }
        Ok(())
    }

    /// 2PL transitions after releasing a lock of the given mode
    fn apply_unlock_state_transition(
        &self,
        txn: &Arc<Transaction>,
        held: LockMode,
    ) -> Result<(), TransactionAbort> {
        let state = txn.state();
        if state == TransactionState::Committed || state == TransactionState::Aborted {
            return Ok(());
        }
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if matches!(held, LockMode::Shared | LockMode::Exclusive) {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            IsolationLevel::ReadCommitted => {
                if held == LockMode::Exclusive {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            IsolationLevel::ReadUncommitted => {
                if held == LockMode::Exclusive {
                    txn.set_state(TransactionState::Shrinking);
                } else if held == LockMode::Shared {
                    // Unlocking S never happens legally under this level;
                    // the source documents it as undefined and aborts
                    return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
                }
            }
        }
        Ok(())
    }

    /// Mark the transaction ABORTED and hand the typed abort to the caller
    fn abort_txn(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        debug!("txn {} aborted: {}", txn.id(), reason);
        TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    // ------------------------------------------------------------------
    // Deadlock detection
    // ------------------------------------------------------------------

    pub fn add_edge(&self, waiter: TxnId, holder: TxnId) {
        self.waits_for.lock().entry(waiter).or_default().insert(holder);
    }

    pub fn remove_edge(&self, waiter: TxnId, holder: TxnId) {
        let mut graph = self.waits_for.lock();
        if let Some(holders) = graph.get_mut(&waiter) {
            holders.remove(&holder);
        }
    }

    /// All edges, sorted by (waiter, holder)
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock();
        let mut edges = Vec::new();
        for (&waiter, holders) in graph.iter() {
            for &holder in holders {
                edges.push((waiter, holder));
            }
        }
        edges
    }

    /// Search the current graph; on a cycle, return its youngest member
    pub fn has_cycle(&self) -> Option<TxnId> {
        let graph = self.waits_for.lock();
        Self::find_cycle_victim(&graph)
    }

    fn find_cycle_victim(graph: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<TxnId> {
        let mut visited: HashSet<TxnId> = HashSet::new();
        for &source in graph.keys() {
            if visited.contains(&source) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(victim) = Self::dfs(graph, source, &mut path, &mut visited) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        node: TxnId,
        path: &mut Vec<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        if let Some(pos) = path.iter().position(|&t| t == node) {
            // Back-edge: the tail of the path is the cycle
            return path[pos..].iter().copied().max();
        }
        if visited.contains(&node) {
            return None;
        }
        path.push(node);
        if let Some(nexts) = graph.get(&node) {
            for &next in nexts {
                if let Some(victim) = Self::dfs(graph, next, path, visited) {
                    return Some(victim);
                }
            }
        }
        path.pop();
        visited.insert(node);
        None
    }

    /// One detector pass: rebuild the graph from the request queues, abort
    /// the youngest member of each cycle and wake it, repeat until no cycle
    /// remains, then clear the graph.
    fn run_detection_pass(&self) {
        loop {
            let (graph, waiting_queues, txns) = self.build_waits_for_graph();
            *self.waits_for.lock() = graph.clone();

            let Some(victim) = Self::find_cycle_victim(&graph) else {
                self.waits_for.lock().clear();
                return;
            };

            debug!("deadlock detected; aborting youngest txn {}", victim);
            match txns.get(&victim) {
                Some(txn) => txn.set_state(TransactionState::Aborted),
                None => warn!("deadlock victim {} vanished before abort", victim),
            }
            if let Some(queues) = waiting_queues.get(&victim) {
                for queue in queues {
                    // Serialize with the waiter's check-then-wait so the
                    // wakeup cannot slip between its state check and sleep
                    drop(queue.state.lock());
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// Build waits-for edges from every request queue: the first waiter
    /// points at each granted holder, later waiters at the waiter ahead of
    /// them (FIFO blocking). Edges touching ABORTED transactions are
    /// skipped.
    #[allow(clippy::type_complexity)]
    fn build_waits_for_graph(
        &self,
    ) -> (
        BTreeMap<TxnId, BTreeSet<TxnId>>,
        HashMap<TxnId, Vec<Arc<LockRequestQueue>>>,
        HashMap<TxnId, Arc<Transaction>>,
    ) {
        let mut graph: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        let mut waiting_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();
        let mut txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();

        let mut queues: Vec<Arc<LockRequestQueue>> =
            self.table_lock_map.lock().values().cloned().collect();
        queues.extend(self.row_lock_map.lock().values().cloned());

        for queue in queues {
            let state = queue.state.lock();
            let mut holders: Vec<&LockRequest> = Vec::new();
            let mut prev_waiter: Option<&LockRequest> = None;
            for request in state.requests.iter() {
                if request.granted {
                    holders.push(request);
                    continue;
                }
                let waiter_id = request.txn.id();
                txns.insert(waiter_id, Arc::clone(&request.txn));
                waiting_queues
                    .entry(waiter_id)
                    .or_default()
                    .push(Arc::clone(&queue));

                let waiter_live = request.txn.state() != TransactionState::Aborted;
                match prev_waiter {
                    None => {
                        for holder in &holders {
                            if waiter_live
                                && holder.txn.state() != TransactionState::Aborted
                            {
                                graph
                                    .entry(waiter_id)
                                    .or_default()
                                    .insert(holder.txn.id());
                            }
                        }
                    }
                    Some(ahead) => {
                        if waiter_live && ahead.txn.state() != TransactionState::Aborted {
                            graph.entry(waiter_id).or_default().insert(ahead.txn.id());
                        }
                    }
                }
                prev_waiter = Some(request);
            }
        }

        (graph, waiting_queues, txns)
    }

    // ------------------------------------------------------------------
    // Queue lookup
    // ------------------------------------------------------------------

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        self.table_lock_map
            .lock()
            .entry(oid)
            .or_insert_with(LockRequestQueue::new)
            .clone()
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        self.row_lock_map
            .lock()
            .entry(rid)
            .or_insert_with(LockRequestQueue::new)
            .clone()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
