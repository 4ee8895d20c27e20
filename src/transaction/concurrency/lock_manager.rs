use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TableId, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbort, TransactionState,
};

/// Lock modes for multi-granularity locking. Rows admit only `Shared` and
/// `Exclusive`; the intention modes exist at table granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The multi-granularity compatibility matrix.
    pub fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (Exclusive, _) | (IntentionShared, Exclusive) => false,
            (IntentionShared, _) => true,
            (IntentionExclusive, IntentionShared) | (IntentionExclusive, IntentionExclusive) => {
                true
            }
            (IntentionExclusive, _) => false,
            (Shared, IntentionShared) | (Shared, Shared) => true,
            (Shared, _) => false,
            (SharedIntentionExclusive, IntentionShared) => true,
            (SharedIntentionExclusive, _) => false,
        }
    }

    fn table_upgrade_allowed(from: LockMode, to: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (from, to),
            (IntentionShared, Shared)
                | (IntentionShared, Exclusive)
                | (IntentionShared, IntentionExclusive)
                | (IntentionShared, SharedIntentionExclusive)
                | (Shared, Exclusive)
                | (Shared, SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive)
                | (IntentionExclusive, SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }

    // Rows never hold SIX, so the row upgrade test only admits the
    // shared/exclusive targets.
    fn row_upgrade_allowed(from: LockMode, to: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (from, to),
            (IntentionShared, Shared)
                | (IntentionShared, Exclusive)
                | (Shared, Exclusive)
                | (IntentionExclusive, Exclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }
}

/// One transaction's standing request for a resource.
pub(crate) struct LockRequest {
    pub(crate) txn_id: TxnId,
    pub(crate) mode: LockMode,
    pub(crate) table_id: TableId,
    pub(crate) rid: Option<Rid>,
    pub(crate) granted: bool,
    pub(crate) txn: Arc<Transaction>,
}

/// FIFO request queue for one resource plus its wait channel.
pub(crate) struct LockQueue {
    pub(crate) state: Mutex<QueueState>,
    pub(crate) cv: Condvar,
}

impl Default for LockQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) requests: VecDeque<LockRequest>,
    pub(crate) upgrading: Option<TxnId>,
}

impl QueueState {
    /// A request is grantable when everything queued ahead of it is granted
    /// and compatible. Requests behind it never block it.
    fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        for request in &self.requests {
            if request.txn_id == txn_id {
                break;
            }
            if !request.granted {
                return false;
            }
            if !LockMode::compatible(request.mode, mode) {
                return false;
            }
        }
        true
    }

    fn grant(&mut self, txn_id: TxnId) {
        if let Some(request) = self.requests.iter_mut().find(|r| r.txn_id == txn_id) {
            request.granted = true;
        }
    }

    fn remove(&mut self, txn_id: TxnId) {
        self.requests.retain(|r| r.txn_id != txn_id);
    }
}

/// Two-phase, multi-granularity lock manager with FIFO queues per resource
/// and background deadlock detection.
///
/// Lock calls return `Ok(true)` on grant and `Ok(false)` when the waiter was
/// aborted from outside (deadlock victim); precondition violations mark the
/// transaction aborted and surface as `Err(TransactionAbort)`.
pub struct LockManager {
    pub(crate) table_lock_map: Mutex<HashMap<TableId, Arc<LockQueue>>>,
    pub(crate) row_lock_map: Mutex<HashMap<Rid, Arc<LockQueue>>>,
    pub(crate) detection_running: Arc<AtomicBool>,
    pub(crate) detector_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            detection_running: Arc::new(AtomicBool::new(false)),
            detector_thread: Mutex::new(None),
        }
    }

    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
    ) -> Result<bool, TransactionAbort> {
        self.check_table_preconditions(txn, mode)?;

        let queue = self.table_queue(table_id);
        let mut state = queue.state.lock();

        if let Some(idx) = state.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held = state.requests[idx].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !LockMode::table_upgrade_allowed(held, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // Re-queue the upgraded request ahead of every waiter, but never
            // ahead of already-granted requests.
            let _ = state.requests.remove(idx);
            txn.remove_table_lock(held, table_id);
            let pos = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                pos,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    table_id,
                    rid: None,
                    granted: false,
                    txn: txn.clone(),
                },
            );
            state.upgrading = Some(txn.id());

            if !Self::wait_for_grant(&queue, &mut state, txn, mode, true) {
                return Ok(false);
            }
            state.upgrading = None;
            state.grant(txn.id());
            txn.add_table_lock(mode, table_id);
            if mode != LockMode::Exclusive {
                queue.cv.notify_all();
            }
            return Ok(true);
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            table_id,
            rid: None,
            granted: false,
            txn: txn.clone(),
        });
        if !Self::wait_for_grant(&queue, &mut state, txn, mode, false) {
            return Ok(false);
        }
        state.grant(txn.id());
        txn.add_table_lock(mode, table_id);
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
    ) -> Result<bool, TransactionAbort> {
        let queue = {
            let map = self.table_lock_map.lock();
            match map.get(&table_id) {
                Some(queue) => queue.clone(),
                None => {
                    drop(map);
                    return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
                }
            }
        };
        if txn.holds_row_locks_on(table_id) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mut state = queue.state.lock();
        let idx = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                drop(state);
                return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            }
        };
        debug_assert_eq!(state.requests[idx].table_id, table_id);
        let mode = state.requests[idx].mode;
        let _ = state.requests.remove(idx);
        queue.cv.notify_all();
        drop(state);

        self.apply_shrinking_transition(txn, mode);
        txn.remove_table_lock(mode, table_id);
        Ok(true)
    }

    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        match mode {
            LockMode::IntentionShared
            | LockMode::IntentionExclusive
            | LockMode::SharedIntentionExclusive => {
                return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
            }
            LockMode::Exclusive => {
                if !txn.is_table_exclusive_locked(table_id)
                    && !txn.is_table_intention_exclusive_locked(table_id)
                    && !txn.is_table_shared_intention_exclusive_locked(table_id)
                {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            LockMode::Shared => {}
        }
        self.check_row_preconditions(txn, mode)?;

        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        if let Some(idx) = state.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held = state.requests[idx].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !LockMode::row_upgrade_allowed(held, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            let _ = state.requests.remove(idx);
            txn.remove_row_lock(held, table_id, rid);
            let pos = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                pos,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    table_id,
                    rid: Some(rid),
                    granted: false,
                    txn: txn.clone(),
                },
            );
            state.upgrading = Some(txn.id());

            if !Self::wait_for_grant(&queue, &mut state, txn, mode, true) {
                return Ok(false);
            }
            state.upgrading = None;
            state.grant(txn.id());
            txn.add_row_lock(mode, table_id, rid);
            if mode != LockMode::Exclusive {
                queue.cv.notify_all();
            }
            return Ok(true);
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            table_id,
            rid: Some(rid),
            granted: false,
            txn: txn.clone(),
        });
        if !Self::wait_for_grant(&queue, &mut state, txn, mode, false) {
            return Ok(false);
        }
        state.grant(txn.id());
        txn.add_row_lock(mode, table_id, rid);
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        let queue = {
            let map = self.row_lock_map.lock();
            match map.get(&rid) {
                Some(queue) => queue.clone(),
                None => {
                    drop(map);
                    return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
                }
            }
        };

        let mut state = queue.state.lock();
        let idx = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                drop(state);
                return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            }
        };
        debug_assert_eq!(state.requests[idx].rid, Some(rid));
        let mode = state.requests[idx].mode;
        let _ = state.requests.remove(idx);
        queue.cv.notify_all();
        drop(state);

        self.apply_shrinking_transition(txn, mode);
        txn.remove_row_lock(mode, table_id, rid);
        Ok(true)
    }

    /// Block until the request at the head of its compatibility window is
    /// grantable, or until the transaction is aborted from outside. Returns
    /// false in the aborted case, with the request already dequeued.
    fn wait_for_grant(
        queue: &LockQueue,
        state: &mut MutexGuard<'_, QueueState>,
        txn: &Arc<Transaction>,
        mode: LockMode,
        upgrading: bool,
    ) -> bool {
        loop {
            if state.can_grant(txn.id(), mode) {
                return true;
            }
            queue.cv.wait(state);
            if txn.state() == TransactionState::Aborted {
                if upgrading {
                    state.upgrading = None;
                }
                state.remove(txn.id());
                queue.cv.notify_all();
                return false;
            }
        }
    }

    fn check_table_preconditions(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionAbort> {
        use LockMode::*;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking
                    && matches!(mode, Exclusive | IntentionExclusive)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn check_row_preconditions(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionAbort> {
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if mode == LockMode::Shared {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking && mode == LockMode::Exclusive {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking && mode != LockMode::Shared {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Releasing X always starts the shrinking phase; repeatable-read also
    /// shrinks on releasing S. Intention locks never do.
    fn apply_shrinking_transition(&self, txn: &Arc<Transaction>, mode: LockMode) {
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrinks
            && !matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            )
        {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        txn.set_abort_reason(reason);
        TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn table_queue(&self, table_id: TableId) -> Arc<LockQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(table_id)
            .or_insert_with(|| Arc::new(LockQueue::default()))
            .clone()
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry(rid)
            .or_insert_with(|| Arc::new(LockQueue::default()))
            .clone()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        // The detector thread only holds a weak handle; flagging it off is
        // enough for it to wind down after at most one interval.
        self.detection_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [
            IntentionShared,
            IntentionExclusive,
            Shared,
            SharedIntentionExclusive,
            Exclusive,
        ];
        // Row-major truth table in the order above.
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, &held) in modes.iter().enumerate() {
            for (j, &requested) in modes.iter().enumerate() {
                assert_eq!(
                    LockMode::compatible(held, requested),
                    expected[i][j],
                    "held {:?} requested {:?}",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_upgrade_tables() {
        use LockMode::*;
        assert!(LockMode::table_upgrade_allowed(IntentionShared, Exclusive));
        assert!(LockMode::table_upgrade_allowed(Shared, SharedIntentionExclusive));
        assert!(LockMode::table_upgrade_allowed(SharedIntentionExclusive, Exclusive));
        assert!(!LockMode::table_upgrade_allowed(Exclusive, Shared));
        assert!(!LockMode::table_upgrade_allowed(Shared, IntentionShared));

        assert!(LockMode::row_upgrade_allowed(Shared, Exclusive));
        assert!(!LockMode::row_upgrade_allowed(Shared, SharedIntentionExclusive));
        assert!(!LockMode::row_upgrade_allowed(Exclusive, Shared));
    }

    #[test]
    fn test_compatible_grants_do_not_block() {
        let lock_manager = LockManager::new();
        let t1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let t2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));

        assert!(lock_manager.lock_table(&t1, LockMode::IntentionShared, 5).unwrap());
        assert!(lock_manager.lock_table(&t2, LockMode::IntentionExclusive, 5).unwrap());
        assert!(t1.is_table_intention_shared_locked(5));
        assert!(t2.is_table_intention_exclusive_locked(5));

        assert!(lock_manager.unlock_table(&t1, 5).unwrap());
        assert!(lock_manager.unlock_table(&t2, 5).unwrap());
        // Intention locks do not start the shrinking phase.
        assert_eq!(t1.state(), TransactionState::Growing);
        assert_eq!(t2.state(), TransactionState::Growing);
    }

    #[test]
    fn test_reacquire_same_mode_short_circuits() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        assert!(lock_manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        assert!(lock_manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        assert!(lock_manager.unlock_table(&txn, 1).unwrap());
        assert_eq!(txn.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_shared_on_read_uncommitted_aborts() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::ReadUncommitted));
        let err = lock_manager
            .lock_table(&txn, LockMode::Shared, 1)
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.abort_reason(), Some(AbortReason::LockSharedOnReadUncommitted));
    }

    #[test]
    fn test_lock_on_shrinking_aborts() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        assert!(lock_manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        assert!(lock_manager.unlock_table(&txn, 1).unwrap());
        assert_eq!(txn.state(), TransactionState::Shrinking);
        let err = lock_manager
            .lock_table(&txn, LockMode::Shared, 2)
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::LockOnShrinking);
    }

    #[test]
    fn test_row_rejects_intention_modes() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let err = lock_manager
            .lock_row(&txn, LockMode::IntentionShared, 1, 9)
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::AttemptedIntentionLockOnRow);
    }

    #[test]
    fn test_exclusive_row_requires_table_lock() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let err = lock_manager
            .lock_row(&txn, LockMode::Exclusive, 1, 9)
            .unwrap_err();
        assert_eq!(err.reason, AbortReason::TableLockNotPresent);
    }

    #[test]
    fn test_unlock_without_lock_aborts() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let err = lock_manager.unlock_table(&txn, 1).unwrap_err();
        assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);
    }

    #[test]
    fn test_table_unlocked_before_rows_aborts() {
        let lock_manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        assert!(lock_manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap());
        assert!(lock_manager.lock_row(&txn, LockMode::Exclusive, 1, 4).unwrap());
        let err = lock_manager.unlock_table(&txn, 1).unwrap_err();
        assert_eq!(err.reason, AbortReason::TableUnlockedBeforeUnlockingRows);
    }
}
