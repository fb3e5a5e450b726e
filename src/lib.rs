// LatticeDB - relational storage engine with CRDT merge columns,
// system-time temporal reads, and vector distance predicates.
// Core library module

pub mod api;
pub mod catalog;
pub mod common;
pub mod crdt;
pub mod engine;
pub mod error;
pub mod execution;
pub mod parser;
pub mod storage;
pub mod transaction;
pub mod types;

pub use engine::Engine;
pub use error::{DbError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the single paged data file.
    pub data_file: String,
    /// Path of the write-ahead log.
    pub log_file: String,
    /// HTTP listen port.
    pub port: u16,
    /// Buffer pool capacity in 4 KiB frames.
    pub buffer_pool_size: usize,
    /// Interval between deadlock detector sweeps.
    pub deadlock_interval: std::time::Duration,
    /// Default lock wait timeout, `None` for unbounded waits.
    pub lock_timeout: Option<std::time::Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: "latticedb.db".to_string(),
            log_file: "latticedb.log".to_string(),
            port: 7070,
            buffer_pool_size: common::DEFAULT_POOL_SIZE,
            deadlock_interval: std::time::Duration::from_millis(100),
            lock_timeout: Some(std::time::Duration::from_secs(30)),
        }
    }
}

impl Config {
    /// Reads `LATTICEDB_DATA_FILE`, `LATTICEDB_LOG_FILE` and `LATTICEDB_PORT`,
    /// falling back to the documented defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("LATTICEDB_DATA_FILE") {
            config.data_file = path;
        }
        if let Ok(path) = std::env::var("LATTICEDB_LOG_FILE") {
            config.log_file = path;
        }
        if let Ok(port) = std::env::var("LATTICEDB_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        config
    }
}
