//! The `Database` value (spec.md §4.11): owns every collaborator, with no
//! process-level singleton. Callers share it across threads themselves by
//! wrapping it in an `Arc`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::buffer::BufferManager;
use crate::disk::DiskSpaceManager;
use crate::error::RecoveryResult;
use crate::lock::{LockContext, LockTable};
use crate::recovery::{CheckpointCapacity, LogManager, RecoveryManager};
use crate::transaction::Transaction;

/// Checkpoint capacity and log placement, replacing the teacher crate's
/// hard-coded `"data/default_db"` path and baked-in timeout constant.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory the log would live in once the buffer manager is backed
    /// by real page files; unused while pages are purely in-memory
    /// (Non-goal: buffer-manager/disk-space-manager internals).
    pub log_path: PathBuf,
    pub max_dpt_entries_per_record: usize,
    pub max_txn_entries_per_record: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("data/default_db"),
            max_dpt_entries_per_record: 100,
            max_txn_entries_per_record: 50,
        }
    }
}

/// The lock-table half of the MGL: the flat table plus the root of the
/// lock-context tree built over it.
pub struct LockManager {
    pub table: Arc<LockTable>,
    pub root: Arc<LockContext>,
}

impl LockManager {
    fn new() -> Self {
        let table = Arc::new(LockTable::new());
        let root = LockContext::root(table.clone());
        Self { table, root }
    }
}

pub struct Database {
    pub config: DatabaseConfig,
    pub buffer: Arc<BufferManager>,
    pub disk: Arc<DiskSpaceManager>,
    pub log_manager: Arc<LogManager>,
    pub recovery: Arc<RecoveryManager>,
    pub locks: LockManager,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        let buffer = Arc::new(BufferManager::new());
        let disk = Arc::new(DiskSpaceManager::new());
        let log_manager = Arc::new(LogManager::new(buffer.clone()));
        let capacity = CheckpointCapacity {
            max_dpt_entries_per_record: config.max_dpt_entries_per_record,
            max_txn_entries_per_record: config.max_txn_entries_per_record,
        };
        let recovery = Arc::new(RecoveryManager::new(log_manager.clone(), buffer.clone(), disk.clone(), capacity));
        let locks = LockManager::new();
        Self { config, buffer, disk, log_manager, recovery, locks }
    }

    /// Start a new transaction and register it with the recovery manager.
    pub fn begin_transaction(&self) -> Arc<Transaction> {
        let tx = Arc::new(Transaction::new());
        self.recovery.start(&tx);
        tx
    }

    pub fn checkpoint(&self) -> RecoveryResult<()> {
        self.recovery.checkpoint()
    }

    /// Run the three-phase restart procedure against this database's own
    /// log (used in tests that simulate a crash by building a fresh
    /// `Database` over a `LogManager` that survived one).
    pub fn restart(&self) -> RecoveryResult<()> {
        self.recovery.restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_transaction_registers_with_recovery_manager() {
        let db = Database::new(DatabaseConfig::default());
        let tx = db.begin_transaction();
        db.recovery.savepoint(&tx, "s");
        assert!(db.recovery.rollback_to_savepoint(&tx, "s").is_ok());
    }

    #[test]
    fn root_lock_context_is_shared_with_the_lock_table() {
        let db = Database::new(DatabaseConfig::default());
        let tx = db.begin_transaction();
        db.locks.root.acquire(&tx, crate::lock::LockMode::S).unwrap();
        assert_eq!(db.locks.root.explicit_mode(&tx), crate::lock::LockMode::S);
    }
}
