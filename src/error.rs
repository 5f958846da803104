//! Error kinds for the two correctness-critical subsystems.
//!
//! These are plain tagged enums rather than exception hierarchies: every
//! operation that can fail names the precise invariant it would otherwise
//! violate (see spec.md §7).

use thiserror::Error;

use crate::lock::resource::ResourceName;
use crate::transaction::TransactionNum;

/// Errors surfaced by the lock table / lock context tree.
///
/// All validation happens before any mutation (see `LockTable::acquire`
/// and friends) so a caller that receives one of these is guaranteed the
/// lock state did not change.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LockError {
    #[error("transaction {tx} already holds a lock on {resource}")]
    DuplicateLockRequest {
        tx: TransactionNum,
        resource: ResourceName,
    },

    #[error("transaction {tx} holds no lock on {resource}")]
    NoLockHeld {
        tx: TransactionNum,
        resource: ResourceName,
    },

    /// Promotion to a mode that is not substitutable for the held mode,
    /// an intent-lock hierarchy violation, or a release attempted while
    /// descendant locks are still held.
    #[error("invalid lock operation on {resource}: {reason}")]
    InvalidLock {
        resource: ResourceName,
        reason: String,
    },

    #[error("context {resource} is read-only")]
    ReadonlyContext { resource: ResourceName },
}

pub type LockResult<T> = Result<T, LockError>;

/// Errors surfaced by the log manager / recovery manager.
///
/// Corrupt log records and a missing master record are fatal: the crate
/// does not attempt to retry or repair them, it propagates them up so the
/// caller can abort startup (spec.md §7).
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log record at LSN {lsn}: {reason}")]
    CorruptLogRecord { lsn: u64, reason: String },

    #[error("missing master record")]
    MissingMasterRecord,

    #[error("log record at LSN {lsn} is not undoable")]
    NotUndoable { lsn: u64 },

    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionNum),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
