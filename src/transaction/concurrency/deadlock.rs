//! Background deadlock detection over the lock manager's wait-for graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::{LockManager, LockQueue};
use crate::transaction::concurrency::transaction::{AbortReason, Transaction, TransactionState};

/// Directed graph with an edge from every waiter to every holder it waits
/// behind, rebuilt from scratch on each detection pass.
#[derive(Default)]
pub(crate) struct WaitForGraph {
    waits_for: BTreeMap<TxnId, Vec<TxnId>>,
    txns: BTreeSet<TxnId>,
    waiters: HashMap<TxnId, (Arc<Transaction>, Arc<LockQueue>)>,
}

impl WaitForGraph {
    pub(crate) fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.waits_for.entry(from).or_default().push(to);
        self.txns.insert(from);
        self.txns.insert(to);
    }

    pub(crate) fn remove_txn(&mut self, txn_id: TxnId) {
        self.waits_for.remove(&txn_id);
        for edges in self.waits_for.values_mut() {
            edges.retain(|&t| t != txn_id);
        }
        self.txns.remove(&txn_id);
    }

    /// Record one queue's contribution: every not-yet-granted request waits
    /// for every granted request ahead of it.
    pub(crate) fn scan_queue(&mut self, queue: &Arc<LockQueue>) {
        let state = queue.state.lock();
        let mut granted = Vec::new();
        for request in &state.requests {
            if request.granted {
                granted.push(request.txn_id);
            } else {
                for &holder in &granted {
                    self.add_edge(request.txn_id, holder);
                }
                self.waiters
                    .insert(request.txn_id, (request.txn.clone(), queue.clone()));
            }
        }
    }

    pub(crate) fn waiter(&self, txn_id: TxnId) -> Option<&(Arc<Transaction>, Arc<LockQueue>)> {
        self.waiters.get(&txn_id)
    }

    /// Find one cycle and name its victim: the youngest transaction on the
    /// active DFS path. Transactions are visited in sorted order, children
    /// expanded in sorted order, so detection is deterministic.
    pub(crate) fn find_victim(&self, safe: &mut BTreeSet<TxnId>) -> Option<TxnId> {
        for &start in &self.txns {
            if safe.contains(&start) {
                continue;
            }
            if let Some(victim) = self.dfs_from(start, safe) {
                return Some(victim);
            }
        }
        None
    }

    fn dfs_from(&self, start: TxnId, safe: &mut BTreeSet<TxnId>) -> Option<TxnId> {
        let mut active: BTreeSet<TxnId> = BTreeSet::new();
        // Explicit stack of (node, sorted children, next child index); the
        // graph can be as deep as the transaction population.
        let mut stack: Vec<(TxnId, Vec<TxnId>, usize)> = Vec::new();
        active.insert(start);
        stack.push((start, self.sorted_children(start), 0));

        while !stack.is_empty() {
            let step = {
                let (node, children, next) = stack.last_mut().expect("stack is non-empty");
                if *next < children.len() {
                    let child = children[*next];
                    *next += 1;
                    Ok(child)
                } else {
                    Err(*node)
                }
            };
            match step {
                Ok(child) => {
                    if safe.contains(&child) {
                        continue;
                    }
                    if active.contains(&child) {
                        return Some(*active.iter().next_back().expect("active path non-empty"));
                    }
                    active.insert(child);
                    let children = self.sorted_children(child);
                    stack.push((child, children, 0));
                }
                Err(node) => {
                    stack.pop();
                    active.remove(&node);
                    safe.insert(node);
                }
            }
        }
        None
    }

    fn sorted_children(&self, txn_id: TxnId) -> Vec<TxnId> {
        let mut children = self.waits_for.get(&txn_id).cloned().unwrap_or_default();
        children.sort_unstable();
        children
    }
}

impl LockManager {
    /// One full detection pass: snapshot the wait-for graph under the map
    /// latches, then abort victims until no cycle remains. Aborted waiters
    /// observe their state on the next condition-variable wakeup.
    pub fn detect_deadlocks(&self) {
        let mut graph = WaitForGraph::default();
        {
            let table_map = self.table_lock_map.lock();
            let row_map = self.row_lock_map.lock();
            for queue in table_map.values() {
                graph.scan_queue(queue);
            }
            for queue in row_map.values() {
                graph.scan_queue(queue);
            }
        }

        let mut safe = BTreeSet::new();
        while let Some(victim) = graph.find_victim(&mut safe) {
            warn!("deadlock detected; aborting transaction {}", victim);
            if let Some((txn, queue)) = graph.waiter(victim) {
                txn.set_state(TransactionState::Aborted);
                txn.set_abort_reason(AbortReason::Deadlock);
                let _state = queue.state.lock();
                queue.cv.notify_all();
            }
            graph.remove_txn(victim);
        }
    }

    /// Spawn the background detector. It holds only a weak handle to the
    /// lock manager and winds down once the manager is dropped or
    /// `stop_deadlock_detection` is called.
    pub fn start_deadlock_detection(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let running = self.detection_running.clone();
        running.store(true, Ordering::SeqCst);
        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);
                match weak.upgrade() {
                    Some(lock_manager) => lock_manager.detect_deadlocks(),
                    None => break,
                }
            }
        });
        *self.detector_thread.lock() = Some(handle);
    }

    pub fn stop_deadlock_detection(&self) {
        self.detection_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_cycle_picks_youngest() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        let mut safe = BTreeSet::new();
        assert_eq!(graph.find_victim(&mut safe), Some(2));
        graph.remove_txn(2);
        let mut safe = BTreeSet::new();
        assert_eq!(graph.find_victim(&mut safe), None);
    }

    #[test]
    fn test_chain_without_cycle_is_clean() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(1, 3);
        let mut safe = BTreeSet::new();
        assert_eq!(graph.find_victim(&mut safe), None);
    }

    #[test]
    fn test_longer_cycle_victim_on_active_path() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 1);
        graph.add_edge(5, 4);
        let mut safe = BTreeSet::new();
        assert_eq!(graph.find_victim(&mut safe), Some(3));
    }

    #[test]
    fn test_disjoint_cycles_found_one_at_a_time() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        graph.add_edge(3, 4);
        graph.add_edge(4, 3);
        let mut safe = BTreeSet::new();
        let first = graph.find_victim(&mut safe).unwrap();
        assert_eq!(first, 2);
        graph.remove_txn(first);
        let second = graph.find_victim(&mut safe).unwrap();
        assert_eq!(second, 4);
        graph.remove_txn(second);
        assert_eq!(graph.find_victim(&mut safe), None);
    }
}
