use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use kestreldb::common::types::TxnId;
use kestreldb::transaction::concurrency::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionManager, TransactionState,
};

const DETECTOR_INTERVAL: Duration = Duration::from_millis(50);

#[test]
fn test_graph_edges_and_simple_cycle() {
    let lm = LockManager::new(Duration::from_secs(3600));

    lm.add_edge(0, 1);
    lm.add_edge(1, 0);
    assert_eq!(lm.edge_list(), vec![(0, 1), (1, 0)]);

    // The youngest member of the cycle is the victim
    assert_eq!(lm.has_cycle(), Some(1));

    lm.remove_edge(1, 0);
    assert_eq!(lm.has_cycle(), None);
    assert_eq!(lm.edge_list(), vec![(0, 1)]);

    lm.shutdown();
}

#[test]
fn test_graph_larger_cycle_picks_youngest() {
    let lm = LockManager::new(Duration::from_secs(3600));

    // 0 -> 1 -> 2 -> 0 plus a dangling tail 3 -> 0
    lm.add_edge(0, 1);
    lm.add_edge(1, 2);
    lm.add_edge(2, 0);
    lm.add_edge(3, 0);
    assert_eq!(lm.has_cycle(), Some(2));

    // Breaking the cycle clears detection; the tail alone is no cycle
    lm.remove_edge(1, 2);
    assert_eq!(lm.has_cycle(), None);

    lm.shutdown();
}

#[test]
fn test_no_false_positive_on_shared_waiting() {
    let lm = LockManager::new(Duration::from_secs(3600));

    // A diamond without a back edge
    lm.add_edge(4, 2);
    lm.add_edge(3, 2);
    lm.add_edge(2, 1);
    assert_eq!(lm.has_cycle(), None);

    lm.shutdown();
}

#[test]
fn test_two_cycles_broken_by_aborting_youngest() {
    // T0 locks t0 then wants t1; T1 locks t1 then wants t0;
    // T2 locks t2 then wants t3; T3 locks t3 then wants t2.
    // The detector must abort T1 and T3, letting T0 and T2 commit.
    let lm = LockManager::new(DETECTOR_INTERVAL);
    let tm = Arc::new(TransactionManager::new(Arc::clone(&lm)));

    let txns: Vec<_> = (0..4)
        .map(|_| tm.begin(IsolationLevel::RepeatableRead))
        .collect();
    let ids: Vec<TxnId> = txns.iter().map(|t| t.id()).collect();

    let barrier = Arc::new(Barrier::new(4));
    let mut handles = Vec::new();
    for (i, txn) in txns.iter().enumerate() {
        let lm = Arc::clone(&lm);
        let tm = Arc::clone(&tm);
        let txn = Arc::clone(txn);
        let barrier = Arc::clone(&barrier);
        // Lock pairs: (t0,t1), (t1,t0), (t2,t3), (t3,t2)
        let first = i as u32;
        let second = match i {
            0 => 1,
            1 => 0,
            2 => 3,
            _ => 2,
        };
        handles.push(thread::spawn(move || {
            lm.lock_table(&txn, LockMode::Exclusive, first).unwrap();
            barrier.wait();
            match lm.lock_table(&txn, LockMode::Exclusive, second) {
                Ok(()) => {
                    tm.commit(&txn).unwrap();
                    true
                }
                Err(abort) => {
                    assert_eq!(abort.reason, AbortReason::Deadlock);
                    tm.abort(&txn).unwrap();
                    false
                }
            }
        }));
    }

    let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // The youngest transaction of each cycle lost
    assert!(outcomes[0], "txn {} should commit", ids[0]);
    assert!(!outcomes[1], "txn {} should be the victim", ids[1]);
    assert!(outcomes[2], "txn {} should commit", ids[2]);
    assert!(!outcomes[3], "txn {} should be the victim", ids[3]);

    lm.shutdown();
}

#[test]
fn test_victim_wakes_and_unwinds() {
    let lm = LockManager::new(DETECTOR_INTERVAL);
    let tm = Arc::new(TransactionManager::new(Arc::clone(&lm)));

    let t0 = tm.begin(IsolationLevel::RepeatableRead);
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t0, LockMode::Exclusive, 10).unwrap();
    lm.lock_table(&t1, LockMode::Exclusive, 11).unwrap();

    let waiter = {
        let lm = Arc::clone(&lm);
        let tm = Arc::clone(&tm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            let result = lm.lock_table(&t1, LockMode::Exclusive, 10);
            if result.is_err() {
                // Unwinding releases t1's held locks and unblocks t0
                tm.abort(&t1).unwrap();
            }
            result
        })
    };
    thread::sleep(Duration::from_millis(20));

    // Closing the cycle from this thread: t0 blocks on t1's table until the
    // detector sacrifices t1 (the younger one)
    lm.lock_table(&t0, LockMode::Exclusive, 11).unwrap();

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.reason, AbortReason::Deadlock);
    assert_eq!(t1.state(), TransactionState::Aborted);

    tm.commit(&t0).unwrap();
    lm.shutdown();
}
