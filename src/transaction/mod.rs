pub mod deadlock;
pub mod lock_manager;
pub mod manager;
pub mod mvcc;
pub mod recovery;
pub mod types;
pub mod wal;

pub use deadlock::{DeadlockDetector, DeadlockStats};
pub use lock_manager::{LockManager, LockResource};
pub use manager::TransactionManager;
pub use mvcc::{VersionEntry, VersionStore};
pub use recovery::{RecoveryManager, RecoveryStats};
pub use types::{
    AbortReason, IsolationLevel, LockMode, Transaction, TransactionState, WriteSetEntry,
};
pub use wal::{ClrAction, LogPayload, LogRecord, WalManager};
