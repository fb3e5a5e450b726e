// MVCC version chains.
//
// Every row update appends a version entry carrying the creating
// transaction and, once that transaction commits, its position in the
// global commit sequence. `FOR SYSTEM_TIME AS OF TX n` walks a chain for
// the latest version with commit sequence <= n. Uncommitted versions are
// visible only to their creator.
//
// Chains are an in-memory structure rebuilt from the heap at startup; the
// recovered state becomes the sequence-zero baseline.

use crate::common::{CommitSeq, Rid, TableOid, TransactionId};
use crate::transaction::types::WriteSetEntry;
use dashmap::DashMap;

/// One version of a row. `data` is `None` for a delete marker.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub data: Option<Vec<u8>>,
    pub txn_id: TransactionId,
    pub commit_seq: Option<CommitSeq>,
}

/// Per-row version lists keyed by (table, rid).
pub struct VersionStore {
    chains: DashMap<(TableOid, Rid), Vec<VersionEntry>>,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// Seeds a chain from recovered heap state (commit sequence 0).
    pub fn baseline(&self, table: TableOid, rid: Rid, data: Vec<u8>) {
        self.chains.insert(
            (table, rid),
            vec![VersionEntry {
                data: Some(data),
                txn_id: 0,
                commit_seq: Some(0),
            }],
        );
    }

    /// Appends an uncommitted version created by `txn_id`.
    pub fn append(&self, table: TableOid, rid: Rid, data: Option<Vec<u8>>, txn_id: TransactionId) {
        self.chains
            .entry((table, rid))
            .or_default()
            .push(VersionEntry {
                data,
                txn_id,
                commit_seq: None,
            });
    }

    /// Stamps every version the transaction created with its commit
    /// sequence number.
    pub fn stamp(&self, writes: &[WriteSetEntry], txn_id: TransactionId, seq: CommitSeq) {
        for w in writes {
            if let Some(mut chain) = self.chains.get_mut(&(w.table, w.rid)) {
                for entry in chain.iter_mut() {
                    if entry.txn_id == txn_id && entry.commit_seq.is_none() {
                        entry.commit_seq = Some(seq);
                    }
                }
            }
        }
    }

    /// Drops the uncommitted versions of an aborting transaction.
    pub fn remove_uncommitted(&self, writes: &[WriteSetEntry], txn_id: TransactionId) {
        for w in writes {
            let mut empty = false;
            if let Some(mut chain) = self.chains.get_mut(&(w.table, w.rid)) {
                chain.retain(|e| !(e.txn_id == txn_id && e.commit_seq.is_none()));
                empty = chain.is_empty();
            }
            if empty {
                self.chains.remove_if(&(w.table, w.rid), |_, c| c.is_empty());
            }
        }
    }

    /// Visible row image for `viewer`, optionally as of a commit sequence.
    ///
    /// - Temporal reads (`as_of = Some(n)`) see the latest version whose
    ///   commit sequence is <= n; n itself is included.
    /// - Current reads see the viewer's own uncommitted version first, then
    ///   the latest committed one.
    pub fn read_visible(
        &self,
        table: TableOid,
        rid: Rid,
        viewer: TransactionId,
        as_of: Option<CommitSeq>,
    ) -> Option<Vec<u8>> {
        let chain = self.chains.get(&(table, rid))?;
        match as_of {
            Some(n) => chain
                .iter()
                .rev()
                .find(|e| e.commit_seq.is_some_and(|s| s <= n))
                .and_then(|e| e.data.clone()),
            None => {
                if let Some(own) = chain
                    .iter()
                    .rev()
                    .find(|e| e.commit_seq.is_none() && e.txn_id == viewer)
                {
                    return own.data.clone();
                }
                chain
                    .iter()
                    .rev()
                    .find(|e| e.commit_seq.is_some())
                    .and_then(|e| e.data.clone())
            }
        }
    }

    /// Commit stamp and creator of the latest committed version, if any.
    /// Feeds the LWW context of the CRDT merge engine.
    pub fn latest_commit_info(
        &self,
        table: TableOid,
        rid: Rid,
    ) -> Option<(CommitSeq, TransactionId)> {
        let chain = self.chains.get(&(table, rid))?;
        chain
            .iter()
            .rev()
            .find(|e| e.commit_seq.is_some())
            .map(|e| (e.commit_seq.unwrap(), e.txn_id))
    }

    /// All rids of a table, in page/slot order.
    pub fn table_rids(&self, table: TableOid) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self
            .chains
            .iter()
            .filter(|entry| entry.key().0 == table)
            .map(|entry| entry.key().1)
            .collect();
        rids.sort();
        rids
    }

    /// Removes a table's chains entirely (DROP TABLE).
    pub fn drop_table(&self, table: TableOid) {
        self.chains.retain(|(t, _), _| *t != table);
    }

    /// Vacuum: deletes versions strictly older than `horizon` (the oldest
    /// active transaction's snapshot), keeping the newest committed version
    /// at or below it as the surviving base. Returns the rows that became
    /// fully dead (their latest surviving version is a delete marker),
    /// so the heap can invalidate their tombstoned slots.
    pub fn vacuum(&self, horizon: CommitSeq) -> Vec<(TableOid, Rid)> {
        let mut dead = Vec::new();
        let mut empty_keys = Vec::new();
        for mut entry in self.chains.iter_mut() {
            let key = *entry.key();
            let chain = entry.value_mut();
            let base = chain
                .iter()
                .enumerate()
                .filter(|(_, e)| e.commit_seq.is_some_and(|s| s <= horizon))
                .map(|(i, _)| i)
                .last();
            if let Some(base_idx) = base {
                chain.drain(..base_idx);
            }
            // A chain whose only survivor is a committed delete marker is
            // dead history.
            if chain.len() == 1
                && chain[0].data.is_none()
                && chain[0].commit_seq.is_some_and(|s| s <= horizon)
            {
                chain.clear();
            }
            if chain.is_empty() {
                empty_keys.push(key);
                dead.push(key);
            }
        }
        for key in empty_keys {
            self.chains.remove_if(&key, |_, c| c.is_empty());
        }
        dead
    }

    /// Number of live chains (diagnostics).
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(table: TableOid, rid: Rid) -> Vec<WriteSetEntry> {
        vec![WriteSetEntry { table, rid }]
    }

    #[test]
    fn test_uncommitted_visible_only_to_creator() {
        let store = VersionStore::new();
        let rid = Rid::new(1, 0);
        store.append(1, rid, Some(vec![1]), 10);
        assert_eq!(store.read_visible(1, rid, 10, None), Some(vec![1]));
        assert_eq!(store.read_visible(1, rid, 11, None), None);
    }

    #[test]
    fn test_temporal_read_walks_chain() {
        let store = VersionStore::new();
        let rid = Rid::new(1, 0);
        store.append(1, rid, Some(vec![1]), 10);
        store.stamp(&w(1, rid), 10, 1);
        store.append(1, rid, Some(vec![2]), 11);
        store.stamp(&w(1, rid), 11, 2);

        // AS OF TX 1 sees the first version; TX 2 and later see the second.
        assert_eq!(store.read_visible(1, rid, 99, Some(1)), Some(vec![1]));
        assert_eq!(store.read_visible(1, rid, 99, Some(2)), Some(vec![2]));
        assert_eq!(store.read_visible(1, rid, 99, Some(7)), Some(vec![2]));
        // Before the first commit there is nothing to see.
        assert_eq!(store.read_visible(1, rid, 99, Some(0)), None);
    }

    #[test]
    fn test_delete_marker_hides_row() {
        let store = VersionStore::new();
        let rid = Rid::new(1, 0);
        store.append(1, rid, Some(vec![1]), 10);
        store.stamp(&w(1, rid), 10, 1);
        store.append(1, rid, None, 11);
        store.stamp(&w(1, rid), 11, 2);

        assert_eq!(store.read_visible(1, rid, 99, None), None);
        assert_eq!(store.read_visible(1, rid, 99, Some(1)), Some(vec![1]));
    }

    #[test]
    fn test_abort_removes_uncommitted() {
        let store = VersionStore::new();
        let rid = Rid::new(1, 0);
        store.append(1, rid, Some(vec![1]), 10);
        store.stamp(&w(1, rid), 10, 1);
        store.append(1, rid, Some(vec![2]), 11);
        store.remove_uncommitted(&w(1, rid), 11);
        assert_eq!(store.read_visible(1, rid, 11, None), Some(vec![1]));
    }

    #[test]
    fn test_vacuum_trims_history() {
        let store = VersionStore::new();
        let rid = Rid::new(1, 0);
        store.append(1, rid, Some(vec![1]), 10);
        store.stamp(&w(1, rid), 10, 1);
        store.append(1, rid, Some(vec![2]), 11);
        store.stamp(&w(1, rid), 11, 2);
        store.append(1, rid, Some(vec![3]), 12);
        store.stamp(&w(1, rid), 12, 3);

        let dead = store.vacuum(2);
        assert!(dead.is_empty());
        // History at or below the horizon is squeezed to its newest entry;
        // anything older is gone.
        assert_eq!(store.read_visible(1, rid, 99, Some(2)), Some(vec![2]));
        assert_eq!(store.read_visible(1, rid, 99, Some(1)), None);
        assert_eq!(store.read_visible(1, rid, 99, None), Some(vec![3]));
    }

    #[test]
    fn test_vacuum_reports_dead_rows() {
        let store = VersionStore::new();
        let rid = Rid::new(1, 0);
        store.append(1, rid, Some(vec![1]), 10);
        store.stamp(&w(1, rid), 10, 1);
        store.append(1, rid, None, 11);
        store.stamp(&w(1, rid), 11, 2);

        let dead = store.vacuum(5);
        assert_eq!(dead, vec![(1, rid)]);
        assert_eq!(store.chain_count(), 0);
    }
}
