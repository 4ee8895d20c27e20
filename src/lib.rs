// Export public modules
pub mod common;
pub mod container;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::config::EngineConfig;
pub use container::ExtendibleHashTable;
pub use index::btree::{BTreeError, BTreeIndex, BTreeIterator};
pub use storage::buffer::replacer::LruKReplacer;
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionAbort,
    TransactionManager, TransactionState,
};
