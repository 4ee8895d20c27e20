use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::common::types::{Rid, TableId, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states. Two-phase locking moves a transaction from Growing to
/// Shrinking on the first lock release that matters for its isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager gave up on a transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while shrinking")]
    LockOnShrinking,
    #[error("shared lock requested under read-uncommitted")]
    LockSharedOnReadUncommitted,
    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,
    #[error("requested mode is not an upgrade of the held one")]
    IncompatibleUpgrade,
    #[error("row lock requested without a covering table lock")]
    TableLockNotPresent,
    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,
    #[error("unlock requested but no lock is held")]
    AttemptedUnlockButNoLockHeld,
    #[error("table unlocked while its row locks are still held")]
    TableUnlockedBeforeUnlockingRows,
    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// Raised by the lock manager after it has marked the transaction aborted;
/// executors propagate it so the transaction manager can roll back.
#[derive(Error, Debug, Clone)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableId>,
    exclusive_tables: HashSet<TableId>,
    intention_shared_tables: HashSet<TableId>,
    intention_exclusive_tables: HashSet<TableId>,
    shared_intention_exclusive_tables: HashSet<TableId>,
    shared_rows: HashMap<TableId, HashSet<Rid>>,
    exclusive_rows: HashMap<TableId, HashSet<Rid>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableId> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

/// An active database transaction, shared between the requesting thread and
/// the lock manager's deadlock detector.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    abort_reason: Mutex<Option<AbortReason>>,
    locks: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            abort_reason: Mutex::new(None),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort_reason.lock()
    }

    pub(crate) fn set_abort_reason(&self, reason: AbortReason) {
        *self.abort_reason.lock() = Some(reason);
    }

    pub fn is_table_shared_locked(&self, table_id: TableId) -> bool {
        self.locks.lock().shared_tables.contains(&table_id)
    }

    pub fn is_table_exclusive_locked(&self, table_id: TableId) -> bool {
        self.locks.lock().exclusive_tables.contains(&table_id)
    }

    pub fn is_table_intention_shared_locked(&self, table_id: TableId) -> bool {
        self.locks.lock().intention_shared_tables.contains(&table_id)
    }

    pub fn is_table_intention_exclusive_locked(&self, table_id: TableId) -> bool {
        self.locks.lock().intention_exclusive_tables.contains(&table_id)
    }

    pub fn is_table_shared_intention_exclusive_locked(&self, table_id: TableId) -> bool {
        self.locks
            .lock()
            .shared_intention_exclusive_tables
            .contains(&table_id)
    }

    pub fn is_row_shared_locked(&self, table_id: TableId, rid: Rid) -> bool {
        self.locks
            .lock()
            .shared_rows
            .get(&table_id)
            .map_or(false, |rows| rows.contains(&rid))
    }

    pub fn is_row_exclusive_locked(&self, table_id: TableId, rid: Rid) -> bool {
        self.locks
            .lock()
            .exclusive_rows
            .get(&table_id)
            .map_or(false, |rows| rows.contains(&rid))
    }

    /// Whether any S/X row locks on the table are still held; tables must
    /// not be unlocked while this is true.
    pub fn holds_row_locks_on(&self, table_id: TableId) -> bool {
        let locks = self.locks.lock();
        locks
            .shared_rows
            .get(&table_id)
            .map_or(false, |rows| !rows.is_empty())
            || locks
                .exclusive_rows
                .get(&table_id)
                .map_or(false, |rows| !rows.is_empty())
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, table_id: TableId) {
        self.locks.lock().table_set_mut(mode).insert(table_id);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, table_id: TableId) {
        self.locks.lock().table_set_mut(mode).remove(&table_id);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, table_id: TableId, rid: Rid) {
        let mut locks = self.locks.lock();
        match mode {
            LockMode::Shared => {
                locks.shared_rows.entry(table_id).or_default().insert(rid);
            }
            LockMode::Exclusive => {
                locks.exclusive_rows.entry(table_id).or_default().insert(rid);
            }
            _ => {}
        }
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, table_id: TableId, rid: Rid) {
        let mut locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => locks.shared_rows.get_mut(&table_id),
            LockMode::Exclusive => locks.exclusive_rows.get_mut(&table_id),
            _ => None,
        };
        if let Some(rows) = rows {
            rows.remove(&rid);
        }
    }

    /// Snapshot of every table this transaction holds any lock on.
    pub fn table_locks(&self) -> Vec<TableId> {
        let locks = self.locks.lock();
        let mut tables: Vec<TableId> = locks
            .shared_tables
            .iter()
            .chain(locks.exclusive_tables.iter())
            .chain(locks.intention_shared_tables.iter())
            .chain(locks.intention_exclusive_tables.iter())
            .chain(locks.shared_intention_exclusive_tables.iter())
            .copied()
            .collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    /// Snapshot of every row lock held, as (table, row) pairs.
    pub fn row_locks(&self) -> Vec<(TableId, Rid)> {
        let locks = self.locks.lock();
        let mut rows: Vec<(TableId, Rid)> = Vec::new();
        for (&table_id, rids) in locks.shared_rows.iter().chain(locks.exclusive_rows.iter()) {
            rows.extend(rids.iter().map(|&rid| (table_id, rid)));
        }
        rows.sort_unstable();
        rows.dedup();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
        assert_eq!(txn.abort_reason(), None);
    }

    #[test]
    fn test_lock_set_tracking() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        txn.add_table_lock(LockMode::IntentionExclusive, 10);
        txn.add_row_lock(LockMode::Exclusive, 10, 3);
        assert!(txn.is_table_intention_exclusive_locked(10));
        assert!(txn.is_row_exclusive_locked(10, 3));
        assert!(txn.holds_row_locks_on(10));

        txn.remove_row_lock(LockMode::Exclusive, 10, 3);
        assert!(!txn.holds_row_locks_on(10));
        txn.remove_table_lock(LockMode::IntentionExclusive, 10);
        assert!(!txn.is_table_intention_exclusive_locked(10));
        assert!(txn.table_locks().is_empty());
    }

    #[test]
    fn test_snapshots_cover_all_sets() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        txn.add_table_lock(LockMode::IntentionShared, 1);
        txn.add_table_lock(LockMode::Shared, 2);
        txn.add_row_lock(LockMode::Shared, 1, 7);
        txn.add_row_lock(LockMode::Shared, 1, 8);
        assert_eq!(txn.table_locks(), vec![1, 2]);
        assert_eq!(txn.row_locks(), vec![(1, 7), (1, 8)]);
    }
}
