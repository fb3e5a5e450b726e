// Core transaction types.
//
// State transitions follow strict two-phase locking:
//
// ```text
// Growing -> Shrinking -> Committed | Aborted
// ```
//
// Any lock may be acquired while Growing; the shrink phase begins when the
// transaction starts releasing at commit/abort. READ COMMITTED may release
// shared locks early without leaving the growing phase.

use crate::common::{Lsn, PageId, Rid, TableOid, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Isolation level for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// Reads take no shared locks; dirty reads possible.
    ReadUncommitted,
    /// Shared locks released right after each read.
    ReadCommitted,
    /// Shared locks held to commit.
    #[default]
    RepeatableRead,
    /// Repeatable read plus table-granular phantom protection.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionState {
    #[default]
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Deadlock,
    LockTimeout,
    UserRollback,
    Error,
}

/// Hierarchical lock modes.
///
/// Compatibility matrix:
///
/// |     | IS | IX | S  | SIX | X  |
/// |-----|----|----|----|-----|----|
/// | IS  | ok | ok | ok | ok  | -  |
/// | IX  | ok | ok | -  | -   | -  |
/// | S   | ok | -  | ok | -   | -  |
/// | SIX | ok | -  | -  | -   | -  |
/// | X   | -  | -  | -  | -   | -  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    SharedIntentExclusive,
    Exclusive,
}

impl LockMode {
    /// Whether two modes may be held on the same resource simultaneously.
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Shared)
                | (IntentShared, SharedIntentExclusive)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
                | (Shared, IntentShared)
                | (Shared, Shared)
                | (SharedIntentExclusive, IntentShared)
        )
    }

    /// Whether a holder of `self` already has every right `requested`
    /// grants, on the lattice `{IS < S < SIX < X, IS < IX < X}`.
    pub fn covers(&self, requested: &LockMode) -> bool {
        use LockMode::*;
        if self == requested {
            return true;
        }
        match (self, requested) {
            (Exclusive, _) => true,
            (SharedIntentExclusive, Shared) | (SharedIntentExclusive, IntentShared) => true,
            (Shared, IntentShared) => true,
            (IntentExclusive, IntentShared) => true,
            _ => false,
        }
    }

    /// Whether `self` may be upgraded to `target` along the lattice.
    pub fn can_upgrade_to(&self, target: &LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, target),
            (IntentShared, Shared)
                | (IntentShared, SharedIntentExclusive)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Exclusive)
                | (Shared, SharedIntentExclusive)
                | (Shared, Exclusive)
                | (SharedIntentExclusive, Exclusive)
                | (IntentExclusive, Exclusive)
        )
    }

    /// Conforming table-level mode required before taking a row lock of
    /// `self`: IS for shared rows, IX (or SIX) for exclusive rows.
    pub fn required_intention(&self) -> LockMode {
        match self {
            LockMode::Exclusive => LockMode::IntentExclusive,
            _ => LockMode::IntentShared,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
            LockMode::IntentShared => write!(f, "IS"),
            LockMode::IntentExclusive => write!(f, "IX"),
            LockMode::SharedIntentExclusive => write!(f, "SIX"),
        }
    }
}

/// One row-level write performed by a transaction, kept for version
/// stamping at commit and version teardown at abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteSetEntry {
    pub table: TableOid,
    pub rid: Rid,
}

/// Transaction context: lifecycle state plus lock and write bookkeeping.
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    pub start_time: DateTime<Utc>,
    /// Commit sequence the transaction started under; the vacuum horizon
    /// never passes the oldest of these.
    pub snapshot_seq: crate::common::CommitSeq,
    /// Last log record written by this transaction.
    pub prev_lsn: Lsn,
    /// RIDs locked in shared mode.
    pub shared_rids: HashSet<(TableOid, Rid)>,
    /// RIDs locked in exclusive mode.
    pub exclusive_rids: HashSet<(TableOid, Rid)>,
    /// Table-level (intention) locks held.
    pub table_locks: HashMap<TableOid, LockMode>,
    /// Pages this transaction has modified.
    pub touched_pages: HashSet<PageId>,
    /// Row versions created by this transaction.
    pub write_set: Vec<WriteSetEntry>,
    pub abort_reason: Option<AbortReason>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: TransactionState::Growing,
            start_time: Utc::now(),
            snapshot_seq: 0,
            prev_lsn: crate::common::INVALID_LSN,
            shared_rids: HashSet::new(),
            exclusive_rids: HashSet::new(),
            table_locks: HashMap::new(),
            touched_pages: HashSet::new(),
            write_set: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn record_write(&mut self, table: TableOid, rid: Rid) {
        self.write_set.push(WriteSetEntry { table, rid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(IntentShared.is_compatible(&IntentExclusive));
        assert!(IntentShared.is_compatible(&SharedIntentExclusive));
        assert!(Shared.is_compatible(&Shared));
        assert!(!Shared.is_compatible(&IntentExclusive));
        assert!(!SharedIntentExclusive.is_compatible(&Shared));
        assert!(!Exclusive.is_compatible(&IntentShared));
        // Symmetry.
        for a in [IntentShared, IntentExclusive, Shared, SharedIntentExclusive, Exclusive] {
            for b in [IntentShared, IntentExclusive, Shared, SharedIntentExclusive, Exclusive] {
                assert_eq!(a.is_compatible(&b), b.is_compatible(&a));
            }
        }
    }

    #[test]
    fn test_upgrade_lattice() {
        use LockMode::*;
        assert!(IntentShared.can_upgrade_to(&Shared));
        assert!(Shared.can_upgrade_to(&Exclusive));
        assert!(SharedIntentExclusive.can_upgrade_to(&Exclusive));
        assert!(IntentExclusive.can_upgrade_to(&Exclusive));
        // S and IX are incomparable.
        assert!(!Shared.can_upgrade_to(&IntentExclusive));
        assert!(!IntentExclusive.can_upgrade_to(&Shared));
    }

    #[test]
    fn test_covers() {
        use LockMode::*;
        assert!(Exclusive.covers(&Shared));
        assert!(SharedIntentExclusive.covers(&Shared));
        assert!(Shared.covers(&IntentShared));
        assert!(!IntentExclusive.covers(&Shared));
    }

    #[test]
    fn test_transaction_defaults() {
        let txn = Transaction::new(1, IsolationLevel::Serializable);
        assert_eq!(txn.state, TransactionState::Growing);
        assert!(txn.is_active());
        assert!(txn.write_set.is_empty());
    }
}
