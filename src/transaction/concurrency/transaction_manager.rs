use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Creates and tracks transactions, and returns their locks to the lock
/// manager when they finish.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.lock().insert(txn_id, txn.clone());
        txn
    }

    /// Commit: release every held lock and retire the transaction.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Committed);
        self.release_locks(txn);
        self.active.lock().remove(&txn.id());
    }

    /// Abort: same teardown as commit, with the aborted state preserved.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.release_locks(txn);
        self.active.lock().remove(&txn.id());
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    pub fn active_txn_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // Row locks go first so the table unlock validation passes.
    fn release_locks(&self, txn: &Arc<Transaction>) {
        for (table_id, rid) in txn.row_locks() {
            let _ = self.lock_manager.unlock_row(txn, table_id, rid);
        }
        for table_id in txn.table_locks() {
            let _ = self.lock_manager.unlock_table(txn, table_id);
        }
    }
}
