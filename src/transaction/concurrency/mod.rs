pub mod deadlock;
pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;

pub use lock_manager::{LockManager, LockMode};
pub use transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbort, TransactionState,
};
pub use transaction_manager::TransactionManager;
