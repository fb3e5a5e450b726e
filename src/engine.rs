// Engine facade.
//
// Owns the component graph (disk -> WAL -> buffer pool -> catalog ->
// locks/MVCC -> executor -> deadlock detector), runs ARIES recovery at
// open, rebuilds the version-store baseline from the heaps, and routes
// statements. SAVE/LOAD DATABASE and VACUUM are handled here; everything
// table-shaped goes through the executor.

use crate::catalog::Catalog;
use crate::common::Rid;
use crate::error::{DbError, Result};
use crate::execution::executor::{Executor, QueryResult, Session};
use crate::parser::{self, ast::Statement};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::DiskManager;
use crate::storage::table_heap::TableHeap;
use crate::transaction::deadlock::DeadlockDetector;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::manager::TransactionManager;
use crate::transaction::mvcc::VersionStore;
use crate::transaction::recovery::RecoveryManager;
use crate::transaction::wal::WalManager;
use crate::Config;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct EngineCore {
    disk: Arc<DiskManager>,
    wal: Arc<WalManager>,
    bp: Arc<BufferPoolManager>,
    catalog: Arc<Catalog>,
    versions: Arc<VersionStore>,
    txn_mgr: Arc<TransactionManager>,
    executor: Executor,
    // Held for its background thread; joined on drop.
    _detector: DeadlockDetector,
}

impl EngineCore {
    fn open(config: &Config) -> Result<Self> {
        let disk = Arc::new(DiskManager::open(&config.data_file)?);
        let wal = Arc::new(WalManager::open(&config.log_file)?);
        let bp = Arc::new(BufferPoolManager::new(
            config.buffer_pool_size,
            disk.clone(),
            wal.clone(),
        ));

        let recovery = RecoveryManager::new(wal.clone(), bp.clone(), disk.clone());
        let stats = recovery.recover()?;
        if stats.records_redone > 0 || stats.loser_txns_undone > 0 {
            tracing::info!(
                redone = stats.records_redone,
                losers = stats.loser_txns_undone,
                "crash recovery complete"
            );
        }

        let catalog = Arc::new(Catalog::load(bp.clone())?);
        let lock_mgr = Arc::new(LockManager::new(config.lock_timeout));
        let versions = Arc::new(VersionStore::new());
        let txn_mgr = Arc::new(TransactionManager::new(
            wal.clone(),
            bp.clone(),
            lock_mgr.clone(),
            versions.clone(),
        ));

        // Recovered rows become the sequence-zero baseline of every chain.
        for info in catalog.list_tables() {
            let heap = TableHeap::new(info.oid, info.first_page_id, bp.clone(), wal.clone());
            for (rid, bytes) in heap.iterate(false)? {
                if let Some(bytes) = bytes {
                    versions.baseline(info.oid, rid, bytes);
                }
            }
        }

        let executor = Executor::new(
            catalog.clone(),
            bp.clone(),
            wal.clone(),
            txn_mgr.clone(),
            lock_mgr.clone(),
            versions.clone(),
        );
        let detector = DeadlockDetector::start(lock_mgr.clone(), config.deadlock_interval);

        Ok(Self {
            disk,
            wal,
            bp,
            catalog,
            versions,
            txn_mgr,
            executor,
            _detector: detector,
        })
    }

    /// Checkpoint plus full page flush; the quiesced on-disk image is
    /// self-contained afterwards.
    fn save(&self) -> Result<()> {
        self.txn_mgr.checkpoint()?;
        self.bp.flush_all()?;
        self.catalog
            .persist_with_next_page(self.disk.allocated_pages())?;
        Ok(())
    }

    fn vacuum(&self) -> Result<usize> {
        let horizon = self.txn_mgr.oldest_active_snapshot();
        let dead = self.versions.vacuum(horizon);
        let mut by_table: HashMap<u32, Vec<Rid>> = HashMap::new();
        for (table, rid) in &dead {
            by_table.entry(*table).or_default().push(*rid);
        }
        for info in self.catalog.list_tables() {
            if let Some(rids) = by_table.get(&info.oid) {
                let heap = TableHeap::new(
                    info.oid,
                    info.first_page_id,
                    self.bp.clone(),
                    self.wal.clone(),
                );
                heap.free_slots(rids)?;
            }
        }
        Ok(dead.len())
    }
}

/// The database engine.
pub struct Engine {
    config: Config,
    core: RwLock<EngineCore>,
    skip_checkpoint_on_drop: AtomicBool,
}

impl Engine {
    /// Opens (running crash recovery if the log demands it) and starts the
    /// background deadlock detector.
    pub fn open(config: Config) -> Result<Self> {
        let core = EngineCore::open(&config)?;
        tracing::info!(
            data_file = %config.data_file,
            log_file = %config.log_file,
            "LatticeDB ready"
        );
        Ok(Self {
            config,
            core: RwLock::new(core),
            skip_checkpoint_on_drop: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parses and executes a script, stopping after `EXIT`.
    pub fn execute_sql(&self, sql: &str, session: &mut Session) -> Result<Vec<QueryResult>> {
        let statements = parser::parse(sql)?;
        let mut results = Vec::with_capacity(statements.len());
        for stmt in &statements {
            if matches!(stmt, Statement::Exit) {
                results.push(QueryResult::message("bye"));
                break;
            }
            results.push(self.execute_parsed(stmt, session)?);
        }
        Ok(results)
    }

    /// Executes one already-parsed statement.
    pub fn execute_parsed(&self, stmt: &Statement, session: &mut Session) -> Result<QueryResult> {
        match stmt {
            Statement::Exit => Ok(QueryResult::message("bye")),
            Statement::SetDpEpsilon(v) => {
                session.dp_epsilon = *v;
                Ok(QueryResult::message(format!("DP_EPSILON set to {}", v)))
            }
            Statement::SetIsolation(level) => {
                session.isolation = *level;
                Ok(QueryResult::message(format!("isolation level set to {}", level)))
            }
            Statement::SaveDatabase { path } => {
                let core = self.core.read();
                core.save()?;
                if let Some(path) = path {
                    std::fs::copy(&self.config.data_file, path)?;
                    Ok(QueryResult::message(format!("database saved to {}", path)))
                } else {
                    Ok(QueryResult::message("database saved"))
                }
            }
            Statement::LoadDatabase { path } => self.load_database(path.as_deref()),
            Statement::Vacuum => {
                let core = self.core.read();
                let removed = core.vacuum()?;
                Ok(QueryResult::message(format!(
                    "vacuum removed {} dead row(s)",
                    removed
                )))
            }
            other => {
                let core = self.core.read();
                core.executor.execute(other, session)
            }
        }
    }

    /// Replaces the running database with a saved image. The current state
    /// is quiesced and checkpointed first; the write-ahead log restarts
    /// empty because the loaded file is a self-contained checkpoint.
    fn load_database(&self, path: Option<&str>) -> Result<QueryResult> {
        let mut core = self.core.write();
        if core.txn_mgr.active_count() > 0 {
            return Err(DbError::Transaction(
                "LOAD DATABASE requires no active transactions".to_string(),
            ));
        }
        core.save()?;
        if let Some(path) = path {
            if !std::path::Path::new(path).exists() {
                return Err(DbError::NotFound(format!("database file {}", path)));
            }
            std::fs::copy(path, &self.config.data_file)?;
            std::fs::remove_file(&self.config.log_file).ok();
        }
        let fresh = EngineCore::open(&self.config)?;
        let old = std::mem::replace(&mut *core, fresh);
        drop(old);
        Ok(QueryResult::message("database loaded"))
    }

    /// Graceful shutdown: checkpoint and flush everything.
    pub fn close(&self) -> Result<()> {
        let core = self.core.read();
        core.save()
    }

    /// Chaos hook: drops the engine without flushing pages, leaving only
    /// the durable WAL behind. What the next `open` recovers is exactly
    /// what a power cut would have left.
    pub fn crash(self) {
        self.skip_checkpoint_on_drop.store(true, Ordering::SeqCst);
        let core = self.core.read();
        // The log itself is already durable up to the last commit.
        let _ = core.wal.flush_all();
        drop(core);
        drop(self);
    }

    /// Current position in the global commit sequence (diagnostics).
    pub fn current_commit_seq(&self) -> u64 {
        self.core.read().txn_mgr.current_commit_seq()
    }

    /// Number of live version chains (diagnostics).
    pub fn version_chain_count(&self) -> usize {
        self.core.read().versions.chain_count()
    }

    /// Whether the WAL has entered panic mode.
    pub fn is_panicked(&self) -> bool {
        self.core.read().wal.is_panicked()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.skip_checkpoint_on_drop.load(Ordering::SeqCst) {
            let core = self.core.read();
            if let Err(e) = core.save() {
                tracing::warn!("checkpoint on shutdown failed: {}", e);
            }
        }
    }
}
