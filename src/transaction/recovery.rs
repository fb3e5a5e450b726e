// ARIES-style crash recovery.
//
// Three passes over the log at startup:
//
// 1. Analysis: from the last CHECKPOINT_BEGIN, rebuild the active
//    transaction table (ATT) and dirty page table (DPT).
// 2. Redo: from min(DPT.recoveryLSN), re-apply every record whose effect
//    is not already on the page (page_lsn comparison).
// 3. Undo: walk each loser's prev_lsn chain backwards, writing
//    compensation log records as undo progresses. CLRs are never undone.
//
// Any I/O failure here is fatal; the engine refuses to open.

use crate::common::{Lsn, PageId, TransactionId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::DiskManager;
use crate::storage::page::SlotKind;
use crate::transaction::wal::{ClrAction, LogPayload, LogRecord, WalManager};
use std::collections::HashMap;
use std::sync::Arc;

/// Recovery outcome counters.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub records_analyzed: usize,
    pub records_redone: usize,
    pub loser_txns_undone: usize,
}

/// Transaction table entry rebuilt during analysis.
#[derive(Debug, Clone)]
struct AttEntry {
    last_lsn: Lsn,
}

/// Runs the three recovery passes.
pub struct RecoveryManager {
    wal: Arc<WalManager>,
    bp: Arc<BufferPoolManager>,
    disk: Arc<DiskManager>,
}

impl RecoveryManager {
    pub fn new(wal: Arc<WalManager>, bp: Arc<BufferPoolManager>, disk: Arc<DiskManager>) -> Self {
        Self { wal, bp, disk }
    }

    pub fn recover(&self) -> Result<RecoveryStats> {
        let records = self
            .wal
            .read_all()
            .map_err(|e| DbError::Recovery(format!("cannot read log: {}", e)))?;
        let mut stats = RecoveryStats::default();
        if records.is_empty() {
            return Ok(stats);
        }
        let by_lsn: HashMap<Lsn, usize> =
            records.iter().enumerate().map(|(i, r)| (r.lsn, i)).collect();

        // ---- Analysis -------------------------------------------------
        let mut att: HashMap<TransactionId, AttEntry> = HashMap::new();
        let mut dpt: HashMap<PageId, Lsn> = HashMap::new();
        let mut start_index = 0;
        for (i, record) in records.iter().enumerate().rev() {
            if let LogPayload::CheckpointBegin {
                att: cp_att,
                dpt: cp_dpt,
            } = &record.payload
            {
                for (txn, last_lsn) in cp_att {
                    att.insert(*txn, AttEntry { last_lsn: *last_lsn });
                }
                for (page, rec_lsn) in cp_dpt {
                    dpt.insert(*page, *rec_lsn);
                }
                start_index = i;
                break;
            }
        }
        for record in &records[start_index..] {
            stats.records_analyzed += 1;
            match &record.payload {
                LogPayload::Begin => {
                    att.insert(record.txn_id, AttEntry { last_lsn: record.lsn });
                }
                LogPayload::Commit | LogPayload::Abort => {
                    att.remove(&record.txn_id);
                }
                LogPayload::Insert { .. }
                | LogPayload::Delete { .. }
                | LogPayload::Update { .. }
                | LogPayload::NewPage { .. }
                | LogPayload::Clr { .. } => {
                    att.insert(record.txn_id, AttEntry { last_lsn: record.lsn });
                    dpt.entry(record.page_id).or_insert(record.lsn);
                }
                LogPayload::CheckpointBegin { .. } | LogPayload::CheckpointEnd => {}
            }
        }

        // ---- Redo -----------------------------------------------------
        let redo_start = dpt.values().copied().min().unwrap_or(u64::MAX);
        for record in &records {
            if record.lsn < redo_start {
                continue;
            }
            let relevant = matches!(
                record.payload,
                LogPayload::Insert { .. }
                    | LogPayload::Delete { .. }
                    | LogPayload::Update { .. }
                    | LogPayload::NewPage { .. }
                    | LogPayload::Clr { .. }
            );
            if !relevant {
                continue;
            }
            match dpt.get(&record.page_id) {
                Some(rec_lsn) if record.lsn >= *rec_lsn => {}
                _ => continue,
            }
            self.redo_record(record)?;
            stats.records_redone += 1;
        }

        // ---- Undo -----------------------------------------------------
        let mut losers: Vec<(TransactionId, Lsn)> =
            att.iter().map(|(t, e)| (*t, e.last_lsn)).collect();
        losers.sort();
        for (txn_id, last_lsn) in losers {
            tracing::info!(txn_id, "undoing loser transaction");
            self.undo_loser(txn_id, last_lsn, &records, &by_lsn)?;
            stats.loser_txns_undone += 1;
        }
        self.wal.flush_all()?;
        Ok(stats)
    }

    fn redo_record(&self, record: &LogRecord) -> Result<()> {
        self.disk.ensure_allocated(record.page_id);
        if let LogPayload::NewPage { prev_page } = &record.payload {
            // Two-page redo: materialize the new page and repair the chain
            // link on its predecessor. Both are idempotent.
            let frame = self.bp.fetch_page(record.page_id)?;
            {
                let mut page = frame.page.write();
                if !page.is_initialized() {
                    page.init(record.page_id);
                }
                if record.lsn > page.lsn() {
                    page.set_prev_page(*prev_page);
                    page.set_lsn(record.lsn);
                }
            }
            self.bp.unpin_page(record.page_id, true);
            if *prev_page != INVALID_PAGE_ID {
                let frame = self.bp.fetch_page(*prev_page)?;
                {
                    let mut page = frame.page.write();
                    if !page.is_initialized() {
                        page.init(*prev_page);
                    }
                    if page.next_page() == INVALID_PAGE_ID {
                        page.set_next_page(record.page_id);
                    }
                }
                self.bp.unpin_page(*prev_page, true);
            }
            return Ok(());
        }

        let frame = self.bp.fetch_page(record.page_id)?;
        {
            let mut page = frame.page.write();
            if !page.is_initialized() {
                page.init(record.page_id);
            }
            if record.lsn > page.lsn() {
                match &record.payload {
                    LogPayload::Insert { slot, data } => {
                        page.ensure_slot(*slot);
                        if page.slot_kind(*slot) == Some(SlotKind::Live) {
                            page.delete_tuple(*slot);
                        }
                        page.restore_tuple(*slot, data)?;
                    }
                    LogPayload::Delete { slot, .. } => {
                        page.delete_tuple(*slot);
                    }
                    LogPayload::Update { slot, new, .. } => {
                        page.ensure_slot(*slot);
                        if page.update_tuple(*slot, new).is_none() {
                            page.delete_tuple(*slot);
                            page.compact();
                            page.restore_tuple(*slot, new)?;
                        }
                    }
                    LogPayload::Clr { action, .. } => {
                        apply_clr_action(&mut page, action)?;
                    }
                    _ => {}
                }
                page.set_lsn(record.lsn);
            }
        }
        self.bp.unpin_page(record.page_id, true);
        Ok(())
    }

    fn undo_loser(
        &self,
        txn_id: TransactionId,
        last_lsn: Lsn,
        records: &[LogRecord],
        by_lsn: &HashMap<Lsn, usize>,
    ) -> Result<()> {
        let mut cursor = last_lsn;
        let mut prev_lsn = last_lsn;
        while cursor != 0 {
            let record = match by_lsn.get(&cursor) {
                Some(&i) => &records[i],
                None => {
                    return Err(DbError::Recovery(format!(
                        "undo chain of txn {} references missing LSN {}",
                        txn_id, cursor
                    )))
                }
            };
            match &record.payload {
                LogPayload::Begin => break,
                LogPayload::Clr { undo_next_lsn, .. } => {
                    // CLRs are never undone; skip past what they compensated.
                    cursor = *undo_next_lsn;
                }
                payload => {
                    if let Some(action) = undo_action_for(payload) {
                        let frame = self.bp.fetch_page(record.page_id)?;
                        {
                            let mut page = frame.page.write();
                            apply_clr_action(&mut page, &action)?;
                            let clr_lsn = self.wal.append(
                                txn_id,
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
        self.wal.append(txn_id, prev_lsn, 0, LogPayload::Abort)?;
        Ok(())
    }
}

/// The inverse of a page mutation, as carried by a CLR.
pub fn undo_action_for(payload: &LogPayload) -> Option<ClrAction> {
    match payload {
        LogPayload::Insert { slot, .. } => Some(ClrAction::UndoInsert { slot: *slot }),
        LogPayload::Delete { slot, old } => Some(ClrAction::UndoDelete {
            slot: *slot,
            data: old.clone(),
        }),
        LogPayload::Update { slot, old, .. } => Some(ClrAction::UndoUpdate {
            slot: *slot,
            old: old.clone(),
        }),
        _ => None,
    }
}

/// Applies a CLR action to a latched page. Used by both the undo pass and
/// runtime aborts.
pub fn apply_clr_action(page: &mut crate::storage::page::Page, action: &ClrAction) -> Result<()> {
    match action {
        ClrAction::UndoInsert { slot } => {
            page.delete_tuple(*slot);
            Ok(())
        }
        ClrAction::UndoDelete { slot, data } => {
            page.ensure_slot(*slot);
            if page.slot_kind(*slot) != Some(SlotKind::Live) {
                if page.restore_tuple(*slot, data).is_err() {
                    page.compact();
                    page.restore_tuple(*slot, data)?;
                }
            }
            Ok(())
        }
        ClrAction::UndoUpdate { slot, old } => {
            page.ensure_slot(*slot);
            if page.update_tuple(*slot, old).is_none() {
                page.delete_tuple(*slot);
                page.compact();
                page.restore_tuple(*slot, old)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::Page;

    #[test]
    fn test_undo_action_inverses() {
        let insert = LogPayload::Insert {
            slot: 1,
            data: vec![1, 2],
        };
        assert_eq!(
            undo_action_for(&insert),
            Some(ClrAction::UndoInsert { slot: 1 })
        );
        assert_eq!(undo_action_for(&LogPayload::Commit), None);
    }

    #[test]
    fn test_apply_undo_delete_restores_bytes() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"abc").unwrap();
        page.delete_tuple(slot).unwrap();
        apply_clr_action(
            &mut page,
            &ClrAction::UndoDelete {
                slot,
                data: b"abc".to_vec(),
            },
        )
        .unwrap();
        assert_eq!(page.get_tuple(slot), Some(&b"abc"[..]));
    }

    #[test]
    fn test_apply_undo_update_restores_old_image() {
        let mut page = Page::new(1);
        let slot = page.insert_tuple(b"new-image").unwrap();
        apply_clr_action(
            &mut page,
            &ClrAction::UndoUpdate {
                slot,
                old: b"old".to_vec(),
            },
        )
        .unwrap();
        assert_eq!(page.get_tuple(slot), Some(&b"old"[..]));
    }
}
