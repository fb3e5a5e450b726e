// Transaction lifecycle.
//
// Begin allocates a wrapping u32 id and logs BEGIN. Commit logs COMMIT,
// forces the log up to it, then assigns the transaction's position in the
// global commit sequence (only transactions that created row versions
// consume a number) and stamps its versions. Abort walks the prev_lsn
// chain backwards, re-applying old images under compensation log records.

use crate::common::{CommitSeq, Lsn, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::mvcc::VersionStore;
use crate::transaction::recovery::{apply_clr_action, undo_action_for};
use crate::transaction::types::{AbortReason, IsolationLevel, Transaction, TransactionState};
use crate::transaction::wal::{LogPayload, WalManager};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handle to a live transaction context.
pub type TxnHandle = Arc<Mutex<Transaction>>;

pub struct TransactionManager {
    wal: Arc<WalManager>,
    bp: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    version_store: Arc<VersionStore>,
    active: RwLock<HashMap<TransactionId, TxnHandle>>,
    next_txn_id: AtomicU32,
    commit_seq: AtomicU64,
}

impl TransactionManager {
    pub fn new(
        wal: Arc<WalManager>,
        bp: Arc<BufferPoolManager>,
        lock_manager: Arc<LockManager>,
        version_store: Arc<VersionStore>,
    ) -> Self {
        Self {
            wal,
            bp,
            lock_manager,
            version_store,
            active: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU32::new(1),
            commit_seq: AtomicU64::new(0),
        }
    }

    /// Position of the latest commit in the global sequence.
    pub fn current_commit_seq(&self) -> CommitSeq {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// Oldest snapshot any active transaction may still read; the vacuum
    /// horizon.
    pub fn oldest_active_snapshot(&self) -> CommitSeq {
        let active = self.active.read();
        active
            .values()
            .map(|t| t.lock().snapshot_seq)
            .min()
            .unwrap_or_else(|| self.current_commit_seq())
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Starts a transaction and logs its BEGIN record.
    pub fn begin(&self, isolation: IsolationLevel) -> Result<TxnHandle> {
        // The id space is u32 and wraps back to 1 on overflow.
        let id = loop {
            let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                break id;
            }
        };
        let mut txn = Transaction::new(id, isolation);
        txn.snapshot_seq = self.current_commit_seq();
        txn.prev_lsn = self.wal.append(id, 0, 0, LogPayload::Begin)?;
        let handle = Arc::new(Mutex::new(txn));
        self.active.write().insert(id, handle.clone());
        Ok(handle)
    }

    /// Commits: COMMIT record, group-committed flush, commit sequence
    /// assignment, version stamping, strict-2PL lock release.
    pub fn commit(&self, handle: &TxnHandle) -> Result<Option<CommitSeq>> {
        let mut txn = handle.lock();
        if txn.state.is_terminal() {
            return Err(DbError::Transaction(format!(
                "transaction {} already finished",
                txn.id
            )));
        }
        txn.state = TransactionState::Shrinking;
        let commit_lsn = self.wal.append(txn.id, txn.prev_lsn, 0, LogPayload::Commit)?;
        txn.prev_lsn = commit_lsn;
        self.wal.flush(commit_lsn)?;

        let seq = if txn.write_set.is_empty() {
            None
        } else {
            let seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.version_store.stamp(&txn.write_set, txn.id, seq);
            Some(seq)
        };

        self.lock_manager.release_all(txn.id);
        txn.state = TransactionState::Committed;
        let id = txn.id;
        drop(txn);
        self.active.write().remove(&id);
        tracing::debug!(txn = id, commit_seq = ?seq, "committed");
        Ok(seq)
    }

    /// Aborts: undo the prev_lsn chain under CLRs, drop uncommitted
    /// versions, log ABORT, release locks.
    pub fn abort(&self, handle: &TxnHandle, reason: AbortReason) -> Result<()> {
        let mut txn = handle.lock();
        if txn.state.is_terminal() {
            return Ok(());
        }
        txn.abort_reason = Some(reason);
        txn.state = TransactionState::Shrinking;

        if self.wal.is_panicked() {
            // No CLRs can be written; recovery will undo from the durable
            // log. Tear down the in-memory footprint only.
            self.version_store.remove_uncommitted(&txn.write_set, txn.id);
            self.lock_manager.release_all(txn.id);
            txn.state = TransactionState::Aborted;
            let id = txn.id;
            drop(txn);
            self.active.write().remove(&id);
            return Ok(());
        }

        // The undo walk reads records back from the file.
        self.wal.flush_all()?;
        let mut cursor = txn.prev_lsn;
        let mut prev_lsn = txn.prev_lsn;
        while cursor != 0 {
            let record = self.wal.read_record_at(cursor)?;
            match &record.payload {
                LogPayload::Begin => break,
                LogPayload::Clr { undo_next_lsn, .. } => {
                    cursor = *undo_next_lsn;
                }
                payload => {
                    if let Some(action) = undo_action_for(payload) {
                        let frame = self.bp.fetch_page(record.page_id)?;
                        {
                            let mut page = frame.page.write();
                            apply_clr_action(&mut page, &action)?;
                            let clr_lsn = self.wal.append(
                                txn.id,
                                prev_lsn,
                                record.page_id,
                                LogPayload::Clr {
                                    undo_next_lsn: record.prev_lsn,
                                    action,
                                },
                            )?;
                            page.set_lsn(clr_lsn);
                            prev_lsn = clr_lsn;
                        }
                        self.bp.unpin_page(record.page_id, true);
                    }
                    cursor = record.prev_lsn;
                }
            }
        }
        self.version_store.remove_uncommitted(&txn.write_set, txn.id);
        let abort_lsn = self.wal.append(txn.id, prev_lsn, 0, LogPayload::Abort)?;
        txn.prev_lsn = abort_lsn;

        self.lock_manager.release_all(txn.id);
        txn.state = TransactionState::Aborted;
        let id = txn.id;
        drop(txn);
        self.active.write().remove(&id);
        tracing::debug!(txn = id, ?reason, "aborted");
        Ok(())
    }

    /// Writes a fuzzy checkpoint: CHECKPOINT_BEGIN with the ATT and DPT,
    /// a flush of every dirty page at or below it, then CHECKPOINT_END.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let att: Vec<(TransactionId, Lsn)> = {
            let active = self.active.read();
            active
                .values()
                .map(|t| {
                    let t = t.lock();
                    (t.id, t.prev_lsn)
                })
                .collect()
        };
        let dpt = self.bp.dirty_pages();
        let begin_lsn = self
            .wal
            .append(0, 0, 0, LogPayload::CheckpointBegin { att, dpt })?;
        self.wal.flush(begin_lsn)?;
        self.bp.flush_all()?;
        let end_lsn = self.wal.append(0, 0, 0, LogPayload::CheckpointEnd)?;
        self.wal.flush(end_lsn)?;
        Ok(begin_lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, TransactionManager) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("data.db")).unwrap());
        let wal = Arc::new(WalManager::open(dir.path().join("wal.log")).unwrap());
        let bp = Arc::new(BufferPoolManager::new(16, disk, wal.clone()));
        let lm = Arc::new(LockManager::new(None));
        let vs = Arc::new(VersionStore::new());
        let tm = TransactionManager::new(wal, bp, lm, vs);
        (dir, tm)
    }

    #[test]
    fn test_read_only_commit_consumes_no_sequence() {
        let (_dir, tm) = setup();
        let t = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(tm.commit(&t).unwrap(), None);
        assert_eq!(tm.current_commit_seq(), 0);
    }

    #[test]
    fn test_writer_commit_advances_sequence() {
        let (_dir, tm) = setup();
        let t = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        {
            let mut txn = t.lock();
            let id = txn.id;
            txn.record_write(1, crate::common::Rid::new(1, 0));
            tm.version_store.append(1, crate::common::Rid::new(1, 0), Some(vec![1]), id);
        }
        assert_eq!(tm.commit(&t).unwrap(), Some(1));
        assert_eq!(tm.current_commit_seq(), 1);
    }

    #[test]
    fn test_double_commit_rejected() {
        let (_dir, tm) = setup();
        let t = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        tm.commit(&t).unwrap();
        assert!(tm.commit(&t).is_err());
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (_dir, tm) = setup();
        let t = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        tm.abort(&t, AbortReason::UserRollback).unwrap();
        tm.abort(&t, AbortReason::UserRollback).unwrap();
        assert_eq!(t.lock().state, TransactionState::Aborted);
    }

    #[test]
    fn test_oldest_active_snapshot_tracks_begin() {
        let (_dir, tm) = setup();
        assert_eq!(tm.oldest_active_snapshot(), 0);
        let t1 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(t1.lock().snapshot_seq, 0);
        tm.commit(&t1).unwrap();
    }
}
