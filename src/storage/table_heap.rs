// Table heap: a doubly linked list of slotted data pages owned by one
// table. Every mutation emits its WAL record and stamps the page header
// with the returned LSN before the page is unpinned dirty.

use crate::common::{PageId, Rid, SlotId, TableOid, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::SlotKind;
use crate::transaction::types::Transaction;
use crate::transaction::wal::{LogPayload, WalManager};
use std::sync::Arc;

/// Result of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The new image replaced the old one in its slot.
    InPlace,
    /// The row moved; the old slot carries a forwarding record.
    Moved(Rid),
}

/// Heap accessor for one table.
pub struct TableHeap {
    table_oid: TableOid,
    first_page: PageId,
    bp: Arc<BufferPoolManager>,
    wal: Arc<WalManager>,
}

impl TableHeap {
    pub fn new(
        table_oid: TableOid,
        first_page: PageId,
        bp: Arc<BufferPoolManager>,
        wal: Arc<WalManager>,
    ) -> Self {
        Self {
            table_oid,
            first_page,
            bp,
            wal,
        }
    }

    pub fn table_oid(&self) -> TableOid {
        self.table_oid
    }

    pub fn first_page(&self) -> PageId {
        self.first_page
    }

    fn log(
        &self,
        txn: &mut Transaction,
        page_id: PageId,
        payload: LogPayload,
    ) -> Result<u64> {
        let lsn = self.wal.append(txn.id, txn.prev_lsn, page_id, payload)?;
        txn.prev_lsn = lsn;
        txn.touched_pages.insert(page_id);
        Ok(lsn)
    }

    /// Fetches a heap page, initializing it if it was allocated but never
    /// written before a crash.
    fn fetch(&self, page_id: PageId) -> Result<Arc<crate::storage::buffer::Frame>> {
        let frame = self.bp.fetch_page(page_id)?;
        {
            let needs_init = !frame.page.read().is_initialized();
            if needs_init {
                let mut page = frame.page.write();
                if !page.is_initialized() {
                    page.init(page_id);
                }
            }
        }
        Ok(frame)
    }

    /// Inserts tuple bytes into the first page with room, extending the
    /// page chain when every page is full.
    pub fn insert_tuple(&self, txn: &mut Transaction, bytes: &[u8]) -> Result<Rid> {
        let mut pid = self.first_page;
        loop {
            let frame = self.fetch(pid)?;
            let mut page = frame.page.write();
            if let Some(slot) = page.insert_tuple(bytes) {
                let lsn = self.log(
                    txn,
                    pid,
                    LogPayload::Insert {
                        slot,
                        data: bytes.to_vec(),
                    },
                )?;
                page.set_lsn(lsn);
                drop(page);
                self.bp.unpin_page(pid, true);
                return Ok(Rid::new(pid, slot));
            }
            let next = page.next_page();
            if next != INVALID_PAGE_ID {
                drop(page);
                self.bp.unpin_page(pid, false);
                pid = next;
                continue;
            }

            // Tail page is full: extend the chain while still holding its
            // latch, so concurrent inserters serialize on the link.
            let (new_pid, new_frame) = self.bp.new_page()?;
            let mut new_page = new_frame.page.write();
            new_page.set_prev_page(pid);
            let lsn = self.log(txn, new_pid, LogPayload::NewPage { prev_page: pid })?;
            new_page.set_lsn(lsn);
            page.set_next_page(new_pid);
            drop(page);
            self.bp.unpin_page(pid, true);

            let slot = new_page.insert_tuple(bytes).ok_or_else(|| {
                DbError::Storage(format!("tuple of {} bytes exceeds page capacity", bytes.len()))
            })?;
            let lsn = self.log(
                txn,
                new_pid,
                LogPayload::Insert {
                    slot,
                    data: bytes.to_vec(),
                },
            )?;
            new_page.set_lsn(lsn);
            drop(new_page);
            self.bp.unpin_page(new_pid, true);
            return Ok(Rid::new(new_pid, slot));
        }
    }

    /// Reads a live tuple, following at most one forwarding hop.
    pub fn get_tuple(&self, rid: Rid) -> Result<Option<Vec<u8>>> {
        let frame = self.fetch(rid.page_id)?;
        let (result, forward) = {
            let page = frame.page.read();
            match page.slot_kind(rid.slot) {
                Some(SlotKind::Live) => (page.get_tuple(rid.slot).map(|b| b.to_vec()), None),
                Some(SlotKind::Forward(target)) => (None, Some(target)),
                _ => (None, None),
            }
        };
        self.bp.unpin_page(rid.page_id, false);
        match forward {
            Some(target) => {
                let frame = self.fetch(target.page_id)?;
                let bytes = frame.page.read().get_tuple(target.slot).map(|b| b.to_vec());
                self.bp.unpin_page(target.page_id, false);
                Ok(bytes)
            }
            None => Ok(result),
        }
    }

    /// Tombstones a tuple, returning its old image.
    pub fn delete_tuple(&self, txn: &mut Transaction, rid: Rid) -> Result<Vec<u8>> {
        let frame = self.fetch(rid.page_id)?;
        let mut page = frame.page.write();
        let old = page.delete_tuple(rid.slot).ok_or_else(|| {
            DbError::NotFound(format!("no live tuple at {}", rid))
        })?;
        let lsn = self.log(
            txn,
            rid.page_id,
            LogPayload::Delete {
                slot: rid.slot,
                old: old.clone(),
            },
        )?;
        page.set_lsn(lsn);
        drop(page);
        self.bp.unpin_page(rid.page_id, true);
        Ok(old)
    }

    /// Updates a tuple in place when it fits, otherwise delete+insert with
    /// a forwarding record left behind.
    pub fn update_tuple(
        &self,
        txn: &mut Transaction,
        rid: Rid,
        bytes: &[u8],
    ) -> Result<UpdateOutcome> {
        let frame = self.fetch(rid.page_id)?;
        let mut page = frame.page.write();
        match page.slot_kind(rid.slot) {
            Some(SlotKind::Live) => {}
            Some(SlotKind::Forward(target)) => {
                drop(page);
                self.bp.unpin_page(rid.page_id, false);
                return self.update_tuple(txn, target, bytes);
            }
            _ => {
                drop(page);
                self.bp.unpin_page(rid.page_id, false);
                return Err(DbError::NotFound(format!("no live tuple at {}", rid)));
            }
        }

        if let Some(old) = page.update_tuple(rid.slot, bytes) {
            let lsn = self.log(
                txn,
                rid.page_id,
                LogPayload::Update {
                    slot: rid.slot,
                    old,
                    new: bytes.to_vec(),
                },
            )?;
            page.set_lsn(lsn);
            drop(page);
            self.bp.unpin_page(rid.page_id, true);
            return Ok(UpdateOutcome::InPlace);
        }

        // Does not fit: tombstone here, re-insert elsewhere, forward.
        let old = page
            .delete_tuple(rid.slot)
            .ok_or_else(|| DbError::Internal("live slot vanished during update".to_string()))?;
        let lsn = self.log(
            txn,
            rid.page_id,
            LogPayload::Delete {
                slot: rid.slot,
                old,
            },
        )?;
        page.set_lsn(lsn);
        drop(page);
        self.bp.unpin_page(rid.page_id, true);

        let new_rid = self.insert_tuple(txn, bytes)?;

        let frame = self.fetch(rid.page_id)?;
        let mut page = frame.page.write();
        if page.set_forwarding(rid.slot, new_rid).is_err() {
            page.compact();
            // Forwarding is an optimization; a full page may simply skip it.
            let _ = page.set_forwarding(rid.slot, new_rid);
        }
        drop(page);
        self.bp.unpin_page(rid.page_id, true);
        Ok(UpdateOutcome::Moved(new_rid))
    }

    /// Live tuples in page/slot order. With `include_dead`, tombstoned
    /// slots are reported with `None` (temporal scans walk their version
    /// chains instead).
    pub fn iterate(&self, include_dead: bool) -> Result<Vec<(Rid, Option<Vec<u8>>)>> {
        let mut rows = Vec::new();
        let mut pid = self.first_page;
        while pid != INVALID_PAGE_ID {
            let frame = self.fetch(pid)?;
            let next = {
                let page = frame.page.read();
                for slot in 0..page.slot_count() {
                    match page.slot_kind(slot) {
                        Some(SlotKind::Live) => rows.push((
                            Rid::new(pid, slot),
                            page.get_tuple(slot).map(|b| b.to_vec()),
                        )),
                        Some(SlotKind::Tombstone) if include_dead => {
                            rows.push((Rid::new(pid, slot), None))
                        }
                        _ => {}
                    }
                }
                page.next_page()
            };
            self.bp.unpin_page(pid, false);
            pid = next;
        }
        Ok(rows)
    }

    /// Vacuum support: invalidates tombstones for rows whose history is
    /// fully dead and compacts each touched page.
    pub fn free_slots(&self, slots: &[Rid]) -> Result<()> {
        use std::collections::BTreeMap;
        let mut by_page: BTreeMap<PageId, Vec<SlotId>> = BTreeMap::new();
        for rid in slots {
            by_page.entry(rid.page_id).or_default().push(rid.slot);
        }
        for (pid, slots) in by_page {
            let frame = self.fetch(pid)?;
            {
                let mut page = frame.page.write();
                for slot in slots {
                    page.free_slot(slot);
                }
                page.compact();
            }
            self.bp.unpin_page(pid, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::transaction::types::IsolationLevel;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, TableHeap, Transaction) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("data.db")).unwrap());
        let wal = Arc::new(WalManager::open(dir.path().join("wal.log")).unwrap());
        let bp = Arc::new(BufferPoolManager::new(16, disk, wal.clone()));
        let (first, frame) = bp.new_page().unwrap();
        drop(frame);
        bp.unpin_page(first, true);
        let heap = TableHeap::new(1, first, bp, wal);
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        (dir, heap, txn)
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, heap, mut txn) = setup();
        let rid = heap.insert_tuple(&mut txn, b"row-one").unwrap();
        assert_eq!(heap.get_tuple(rid).unwrap(), Some(b"row-one".to_vec()));
        assert!(txn.prev_lsn > 0 || txn.prev_lsn == 0);
        assert!(txn.touched_pages.contains(&rid.page_id));
    }

    #[test]
    fn test_chain_extension_under_volume() {
        let (_dir, heap, mut txn) = setup();
        let payload = vec![7u8; 512];
        let mut rids = Vec::new();
        for _ in 0..50 {
            rids.push(heap.insert_tuple(&mut txn, &payload).unwrap());
        }
        let pages: std::collections::HashSet<_> = rids.iter().map(|r| r.page_id).collect();
        assert!(pages.len() > 1);
        let rows = heap.iterate(false).unwrap();
        assert_eq!(rows.len(), 50);
    }

    #[test]
    fn test_update_in_place_and_moved() {
        let (_dir, heap, mut txn) = setup();
        let rid = heap.insert_tuple(&mut txn, &[1u8; 100]).unwrap();
        // Same size: in place.
        assert_eq!(
            heap.update_tuple(&mut txn, rid, &[2u8; 100]).unwrap(),
            UpdateOutcome::InPlace
        );
        // Fill the page so a grown image must move.
        while heap
            .insert_tuple(&mut txn, &[3u8; 900])
            .map(|r| r.page_id == rid.page_id)
            .unwrap_or(false)
        {}
        let outcome = heap.update_tuple(&mut txn, rid, &[4u8; 3000]).unwrap();
        match outcome {
            UpdateOutcome::Moved(new_rid) => {
                assert_ne!(new_rid, rid);
                // Old rid still resolves through the forwarding record.
                assert_eq!(heap.get_tuple(rid).unwrap(), Some(vec![4u8; 3000]));
            }
            UpdateOutcome::InPlace => panic!("expected a move"),
        }
    }

    #[test]
    fn test_delete_then_iterate_skips() {
        let (_dir, heap, mut txn) = setup();
        let a = heap.insert_tuple(&mut txn, b"a").unwrap();
        let _b = heap.insert_tuple(&mut txn, b"b").unwrap();
        heap.delete_tuple(&mut txn, a).unwrap();
        let rows = heap.iterate(false).unwrap();
        assert_eq!(rows.len(), 1);
        let with_dead = heap.iterate(true).unwrap();
        assert_eq!(with_dead.len(), 2);
        assert!(with_dead.iter().any(|(rid, data)| *rid == a && data.is_none()));
    }
}
