// Hierarchical lock manager.
//
// Each resource (a table or a row) owns a FIFO request queue guarded by a
// mutex and condition variable. Grants are compatible sets; `unlock` wakes
// the longest contiguous prefix of waiters compatible with the remaining
// grants. A transaction already holding a lock may upgrade along the
// lattice `{IS < S < SIX < X, IS < IX < X}`; at most one upgrade may be
// pending per queue and it waits at the head of the line.
//
// Deadlock victims are marked by the detector; their waiting threads wake
// immediately and surface `DbError::Deadlock`.

use crate::common::{Rid, TableOid, TransactionId};
use crate::error::{DbError, Result};
use crate::transaction::types::{LockMode, Transaction, TransactionState};
use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    Table(TableOid),
    Row(TableOid, Rid),
}

#[derive(Debug)]
struct Waiter {
    txn_id: TransactionId,
    mode: LockMode,
    upgrading_from: Option<LockMode>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Currently granted (txn, mode) pairs; mutually compatible.
    grants: Vec<(TransactionId, LockMode)>,
    /// FIFO wait line; a pending upgrade sits at the front.
    waiters: VecDeque<Waiter>,
}

impl QueueState {
    fn grant_mode(&self, txn_id: TransactionId) -> Option<LockMode> {
        self.grants
            .iter()
            .find(|(t, _)| *t == txn_id)
            .map(|(_, m)| *m)
    }

    fn holds(&self, txn_id: TransactionId, mode: &LockMode) -> bool {
        self.grants
            .iter()
            .any(|(t, m)| *t == txn_id && m.covers(mode))
    }

    fn has_pending_upgrade(&self) -> bool {
        self.waiters.iter().any(|w| w.upgrading_from.is_some())
    }

    fn remove_waiter(&mut self, txn_id: TransactionId) {
        self.waiters.retain(|w| w.txn_id != txn_id);
    }

    /// Grants the longest compatible FIFO prefix.
    fn grant_pass(&mut self) {
        loop {
            let grantable = match self.waiters.front() {
                Some(front) => self
                    .grants
                    .iter()
                    .all(|(t, m)| *t == front.txn_id || m.is_compatible(&front.mode)),
                None => break,
            };
            if !grantable {
                break;
            }
            let w = self.waiters.pop_front().unwrap();
            if w.upgrading_from.is_some() {
                if let Some(entry) = self.grants.iter_mut().find(|(t, _)| *t == w.txn_id) {
                    entry.1 = w.mode;
                }
            } else {
                self.grants.push((w.txn_id, w.mode));
            }
        }
    }
}

struct LockQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        }
    }
}

/// The lock manager.
pub struct LockManager {
    queues: DashMap<LockResource, Arc<LockQueue>>,
    held: DashMap<TransactionId, HashSet<LockResource>>,
    victims: DashSet<TransactionId>,
    default_timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            queues: DashMap::new(),
            held: DashMap::new(),
            victims: DashSet::new(),
            default_timeout,
        }
    }

    /// Acquires a table-level lock, blocking until compatible.
    pub fn lock_table(&self, txn: &mut Transaction, mode: LockMode, oid: TableOid) -> Result<()> {
        self.check_growing(txn)?;
        self.acquire(txn.id, LockResource::Table(oid), mode, self.default_timeout)?;
        let effective = match txn.table_locks.get(&oid) {
            Some(held) if held.covers(&mode) => *held,
            _ => mode,
        };
        txn.table_locks.insert(oid, effective);
        Ok(())
    }

    /// Acquires a row-level lock. The transaction must already hold a
    /// conforming intention lock on the enclosing table.
    pub fn lock_row(
        &self,
        txn: &mut Transaction,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<()> {
        self.check_growing(txn)?;
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(DbError::Lock(format!(
                "intention mode {} is not valid on a row",
                mode
            )));
        }
        let required = mode.required_intention();
        let conforming = txn.table_locks.get(&oid).is_some_and(|held| {
            held.covers(&required) || *held == LockMode::SharedIntentExclusive
        });
        if !conforming {
            return Err(DbError::Lock(format!(
                "row lock {} on table {} requires a {} table lock",
                mode, oid, required
            )));
        }
        self.acquire(txn.id, LockResource::Row(oid, rid), mode, self.default_timeout)?;
        match mode {
            LockMode::Shared => {
                txn.shared_rids.insert((oid, rid));
            }
            LockMode::Exclusive => {
                txn.shared_rids.remove(&(oid, rid));
                txn.exclusive_rids.insert((oid, rid));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Early release of a shared row lock (READ COMMITTED). Does not move
    /// the transaction into its shrinking phase.
    pub fn unlock_row_shared(&self, txn: &mut Transaction, oid: TableOid, rid: Rid) {
        if txn.exclusive_rids.contains(&(oid, rid)) {
            return;
        }
        if txn.shared_rids.remove(&(oid, rid)) {
            self.unlock(txn.id, LockResource::Row(oid, rid));
        }
    }

    /// Releases every lock the transaction holds. Called at commit/abort.
    pub fn release_all(&self, txn_id: TransactionId) {
        let resources = self
            .held
            .remove(&txn_id)
            .map(|(_, set)| set)
            .unwrap_or_default();
        for resource in resources {
            self.unlock_queue(txn_id, resource);
        }
        self.victims.remove(&txn_id);
    }

    /// Removes one grant and wakes newly compatible waiters.
    pub fn unlock(&self, txn_id: TransactionId, resource: LockResource) {
        self.unlock_queue(txn_id, resource);
        if let Some(mut set) = self.held.get_mut(&txn_id) {
            set.remove(&resource);
        }
    }

    fn unlock_queue(&self, txn_id: TransactionId, resource: LockResource) {
        let queue = match self.queues.get(&resource) {
            Some(q) => q.clone(),
            None => return,
        };
        let mut state = queue.state.lock();
        state.grants.retain(|(t, _)| *t != txn_id);
        state.grant_pass();
        queue.cond.notify_all();
    }

    /// Marks a transaction as a deadlock victim and wakes every queue it
    /// might be waiting in.
    pub fn mark_victim(&self, txn_id: TransactionId) {
        self.victims.insert(txn_id);
        for entry in self.queues.iter() {
            entry.value().cond.notify_all();
        }
    }

    pub fn is_victim(&self, txn_id: TransactionId) -> bool {
        self.victims.contains(&txn_id)
    }

    /// Waits-for edges for the deadlock detector: each waiter waits for
    /// every incompatible current holder. Waiters already condemned as
    /// victims are treated as gone, so one sweep aborts exactly one
    /// transaction per cycle.
    pub fn waits_for_edges(&self) -> Vec<(TransactionId, TransactionId)> {
        let mut edges = Vec::new();
        for entry in self.queues.iter() {
            let state = entry.value().state.lock();
            for waiter in &state.waiters {
                if self.victims.contains(&waiter.txn_id) {
                    continue;
                }
                for (holder, mode) in &state.grants {
                    if *holder != waiter.txn_id && !mode.is_compatible(&waiter.mode) {
                        edges.push((waiter.txn_id, *holder));
                    }
                }
            }
        }
        edges
    }

    fn check_growing(&self, txn: &Transaction) -> Result<()> {
        match txn.state {
            TransactionState::Growing => Ok(()),
            TransactionState::Shrinking => Err(DbError::Transaction(
                "cannot acquire locks in the shrinking phase".to_string(),
            )),
            _ => Err(DbError::Transaction(format!(
                "transaction {} is no longer active",
                txn.id
            ))),
        }
    }

    fn acquire(
        &self,
        txn_id: TransactionId,
        resource: LockResource,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let queue = self
            .queues
            .entry(resource)
            .or_insert_with(|| Arc::new(LockQueue::new()))
            .clone();
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut state = queue.state.lock();
        if let Some(held) = state.grant_mode(txn_id) {
            if held.covers(&mode) {
                return Ok(());
            }
            if !held.can_upgrade_to(&mode) {
                return Err(DbError::Lock(format!(
                    "cannot upgrade {} to {}",
                    held, mode
                )));
            }
            if state.has_pending_upgrade() {
                return Err(DbError::Lock(
                    "another upgrade is already pending on this resource".to_string(),
                ));
            }
            state.waiters.push_front(Waiter {
                txn_id,
                mode,
                upgrading_from: Some(held),
            });
        } else {
            state.waiters.push_back(Waiter {
                txn_id,
                mode,
                upgrading_from: None,
            });
        }
        state.grant_pass();

        loop {
            if state.holds(txn_id, &mode) {
                drop(state);
                self.held.entry(txn_id).or_default().insert(resource);
                return Ok(());
            }
            if self.victims.contains(&txn_id) {
                state.remove_waiter(txn_id);
                state.grant_pass();
                queue.cond.notify_all();
                return Err(DbError::Deadlock);
            }
            match deadline {
                Some(d) => {
                    if queue.cond.wait_until(&mut state, d).timed_out() {
                        if state.holds(txn_id, &mode) {
                            drop(state);
                            self.held.entry(txn_id).or_default().insert(resource);
                            return Ok(());
                        }
                        state.remove_waiter(txn_id);
                        state.grant_pass();
                        queue.cond.notify_all();
                        return Err(DbError::LockTimeout);
                    }
                }
                None => queue.cond.wait(&mut state),
            }
        }
    }
}
